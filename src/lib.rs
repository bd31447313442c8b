use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use globwalk::GlobWalkerBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Weights for the symbol-to-label nearest line search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkWeights {
    pub row_weight: f64,
    pub column_weight: f64,
}

impl Default for LinkWeights {
    fn default() -> Self {
        Self { row_weight: 1.2, column_weight: 1.0 }
    }
}

/// Admission window around an anchor. "Perpendicular" is the axis across the
/// reading direction (dy on horizontal pages, dx on vertical pages).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchWindow {
    pub max_perpendicular: f64,
    pub max_parallel: f64,
    pub perpendicular_weight: f64,
    pub parallel_weight: f64,
}

impl SearchWindow {
    pub fn horizontal() -> Self {
        Self { max_perpendicular: 90.0, max_parallel: 900.0, perpendicular_weight: 2.0, parallel_weight: 0.7 }
    }
    pub fn vertical() -> Self {
        Self { max_perpendicular: 130.0, max_parallel: 800.0, perpendicular_weight: 2.0, parallel_weight: 0.7 }
    }
}

// Keys given in YAML, laid over the orientation's own defaults.
#[derive(Deserialize)]
struct WindowOverrides {
    max_perpendicular: Option<f64>,
    max_parallel: Option<f64>,
    perpendicular_weight: Option<f64>,
    parallel_weight: Option<f64>,
}

impl WindowOverrides {
    fn over(self, base: SearchWindow) -> SearchWindow {
        SearchWindow {
            max_perpendicular: self.max_perpendicular.unwrap_or(base.max_perpendicular),
            max_parallel: self.max_parallel.unwrap_or(base.max_parallel),
            perpendicular_weight: self.perpendicular_weight.unwrap_or(base.perpendicular_weight),
            parallel_weight: self.parallel_weight.unwrap_or(base.parallel_weight),
        }
    }
}

fn horizontal_window<'de, D: Deserializer<'de>>(d: D) -> Result<SearchWindow, D::Error> {
    Ok(WindowOverrides::deserialize(d)?.over(SearchWindow::horizontal()))
}

fn vertical_window<'de, D: Deserializer<'de>>(d: D) -> Result<SearchWindow, D::Error> {
    Ok(WindowOverrides::deserialize(d)?.over(SearchWindow::vertical()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborhoodConfig {
    /// Median height/width ratio above which a page is treated as vertical text.
    pub vertical_ratio: f64,
    #[serde(default = "SearchWindow::horizontal", deserialize_with = "horizontal_window")]
    pub horizontal: SearchWindow,
    #[serde(default = "SearchWindow::vertical", deserialize_with = "vertical_window")]
    pub vertical: SearchWindow,
    pub max_neighbors: usize,
}

impl Default for NeighborhoodConfig {
    fn default() -> Self {
        Self {
            vertical_ratio: 1.2,
            horizontal: SearchWindow::horizontal(),
            vertical: SearchWindow::vertical(),
            max_neighbors: 12,
        }
    }
}

/// Tunable heuristics for normalization, annotation and candidate extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub low_confidence_threshold: f64,
    pub boilerplate_repeat_threshold: usize,
    /// Checkbox lines needed before a whole page counts as a form template.
    pub form_checkbox_min: usize,
    pub checkbox_link: LinkWeights,
    pub neighborhood: NeighborhoodConfig,
    pub short_line_max_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            low_confidence_threshold: 0.6,
            boilerplate_repeat_threshold: 3,
            form_checkbox_min: 4,
            checkbox_link: LinkWeights::default(),
            neighborhood: NeighborhoodConfig::default(),
            short_line_max_chars: 40,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.low_confidence_threshold > 0.0 && self.low_confidence_threshold <= 1.0) {
            return Err(ConfigError::Invalid("low_confidence_threshold must be in (0, 1]".into()));
        }
        if self.boilerplate_repeat_threshold == 0 {
            return Err(ConfigError::Invalid("boilerplate_repeat_threshold must be >= 1".into()));
        }
        if self.neighborhood.max_neighbors == 0 {
            return Err(ConfigError::Invalid("neighborhood.max_neighbors must be >= 1".into()));
        }
        for (name, w) in [("horizontal", &self.neighborhood.horizontal), ("vertical", &self.neighborhood.vertical)] {
            if w.max_perpendicular <= 0.0 || w.max_parallel <= 0.0 {
                return Err(ConfigError::Invalid(format!("neighborhood.{} window must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Load an engine config from YAML. Missing keys fall back to defaults.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let cfg: EngineConfig = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub mod flag {
    pub const LOW_CONFIDENCE: &str = "low_confidence";
    pub const CHECKBOX_LIKE: &str = "checkbox_like";
    pub const CHECKBOX_OPTION: &str = "checkbox_option";
    pub const CHECKBOX_STATE: &str = "checkbox_state";
    pub const FORM_TEMPLATE: &str = "form_template";
    pub const BOILERPLATE: &str = "boilerplate";
    pub const CHECKBOX_LINKED_FROM: &str = "checkbox_linked_from_line_id";
}

/// Open set of annotations contributed by the different passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(BTreeMap<String, Value>);

impl Flags {
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), value.into());
    }
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
    pub fn is_true(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(Value::Bool(true)))
    }
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn checkbox_state(&self) -> Option<CheckboxState> {
        match self.get_str(flag::CHECKBOX_STATE) {
            Some("checked") => Some(CheckboxState::Checked),
            Some("unchecked") => Some(CheckboxState::Unchecked),
            _ => None,
        }
    }
    /// An unticked option on a form page; never a patient-asserted fact.
    pub fn is_unchecked_template(&self) -> bool {
        self.is_true(flag::FORM_TEMPLATE) && self.checkbox_state() == Some(CheckboxState::Unchecked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckboxState {
    Checked,
    Unchecked,
}

impl CheckboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckboxState::Checked => "checked",
            CheckboxState::Unchecked => "unchecked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x as f64 + self.width as f64 / 2.0, self.y as f64 + self.height as f64 / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub line_id: u32,
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub paragraph_id: Option<i64>,
    #[serde(default)]
    pub flags: Flags,
}

impl Line {
    pub fn center(&self) -> Option<(f64, f64)> {
        self.bounding_box.as_ref().map(BoundingBox::center)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub page_number: Option<u32>,
    pub lines: Vec<Line>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[serde(alias = "lims_text")]
    TrustedText,
    Pdf,
    Png,
    Jpg,
    Docx,
    OcrAttachment,
    Unknown,
}

impl SourceType {
    pub fn is_trusted(&self) -> bool {
        matches!(self, SourceType::TrustedText)
    }
    pub fn is_ocr_derived(&self) -> bool {
        matches!(self, SourceType::OcrAttachment | SourceType::Pdf | SourceType::Png | SourceType::Jpg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub source_type: SourceType,
    /// Record field a trusted-text source was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_field: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pages: Vec<Page>,
}

impl Source {
    pub fn new(source_id: impl Into<String>, source_type: SourceType) -> Self {
        Self { source_id: source_id.into(), source_type, origin_field: None, error: None, pages: Vec::new() }
    }

    /// A source that could not be produced. Kept for auditability.
    pub fn failed(source_id: impl Into<String>, source_type: SourceType, error: impl Into<String>) -> Self {
        let mut s = Self::new(source_id, source_type);
        s.error = Some(error.into());
        s
    }

    pub fn record_error(&mut self, message: &str) {
        self.error = Some(match self.error.take() {
            Some(prev) => format!("{}; {}", prev, message),
            None => message.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub case_id: String,
    pub sources: Vec<Source>,
}

impl Document {
    pub fn new(case_id: impl Into<String>) -> Self {
        Self { case_id: case_id.into(), sources: Vec::new() }
    }

    /// Every line with its owning source and page, in document order.
    pub fn lines(&self) -> impl Iterator<Item = (&Source, &Page, &Line)> + '_ {
        self.sources
            .iter()
            .flat_map(|s| s.pages.iter().flat_map(move |p| p.lines.iter().map(move |l| (s, p, l))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Diagnosis,
    ChiefComplaint,
    MedicalHistory,
    FamilyHistory,
    TestsAndExams,
    Plan,
    PatientInfo,
}

pub type KeywordTable = &'static [(Section, &'static [&'static str])];

const PATIENT_SIGNAL_KEYWORDS: &[&str] = &["姓名", "年龄", "性别", "联系电话", "病历号", "病历ID"];

/// Per-candidate section tagging, checked in order.
pub const SECTION_HINTS: KeywordTable = &[
    (Section::Diagnosis, &["临床诊断", "诊断", "疾病"]),
    (Section::ChiefComplaint, &["主诉", "送检原因", "就诊原因"]),
    (Section::MedicalHistory, &["主诉", "现病史", "病史", "IVF", "ICSI", "症状", "表现", "流产"]),
    (Section::FamilyHistory, &["家族史"]),
    (Section::TestsAndExams, &["检测", "检查", "核型", "染色体", "样本", "阳性", "阴性"]),
    (Section::Plan, &["建议", "随访", "复查", "计划", "报告比对"]),
    (Section::PatientInfo, PATIENT_SIGNAL_KEYWORDS),
];

/// Section-identifying words used to seed the neighborhood search.
pub const ANCHOR_KEYWORDS: KeywordTable = &[
    (Section::Diagnosis, &["临床诊断", "诊断", "病例", "病历", "结论"]),
    (Section::ChiefComplaint, &["主诉", "送检原因", "就诊原因"]),
    (Section::MedicalHistory, &["现病史", "病史", "临床表现", "症状"]),
    (Section::FamilyHistory, &["家族史"]),
    (Section::TestsAndExams, &["检查", "检测", "核型", "染色体", "样本", "结果"]),
    (Section::Plan, &["建议", "随访", "复查", "方案", "治疗"]),
];

const FORM_NOISE_KEYWORDS: &[&str] = &[
    "版本号", "识别码", "官网", "地址", "电话", "本知材料一式三联", "请在相应的", "知情同意书",
];

// Assay/panel vocabulary, unrelated to the patient's phenotype.
const DETECTION_NOISE_KEYWORDS: &[&str] = &[
    "检测项目", "送检项目", "套餐", "全外显子", "外显子", "携带者", "Panel", "WES", "NGS", "测序", "核型",
    "染色体", "样本类型", "采样日期", "收样", "建库", "捕获", "上机", "深度",
];

const MEDICAL_SIGNAL_KEYWORDS: &[&str] = &[
    "临床诊断", "诊断", "病历", "主诉", "既往史", "家族史", "病史", "流产", "妊娠", "症状", "检测", "检查",
    "染色体", "核型", "样本", "阳性", "阴性", "未见", "否认", "无", "IVF", "ICSI",
];

const FORM_TEMPLATE_KEYWORDS: &[&str] = &[
    "请在相应的", "知情同意书", "送检单", "检测项目", "样本类型", "受检者确认", "医师确认", "受检者陈述", "医师陈述",
];

const NEGATION_HINTS: &[&str] = &["否认", "未见", "无明显", "无异常", "未发现", "未提示", "没有", "阴性"];
const ROUTE_DIAGNOSIS_HINTS: &[&str] = &["诊断", "临床诊断", "病历", "疾病"];
const ROUTE_EXAM_HINTS: &[&str] = &["检查", "检测", "核型", "染色体", "样本"];
const ROUTE_HISTORY_HINTS: &[&str] = &["既往史", "病史", "家族史"];

pub const CHECKBOX_GLYPHS: &[char] = &['□', '■', '☑', '☐', '√', '✓', '✗', '✘'];
const CHECKED_GLYPHS: &[char] = &['☑', '✓', '√', '■'];
const UNCHECKED_GLYPHS: &[char] = &['□', '☐'];
// OCR often reads an empty box as one of these CJK characters.
const GLYPH_ONLY_CHARS: &[char] = &['口', '日', '曰', '□', '■', '☐', '☑', '✓', '√'];
const BOILERPLATE_PUNCT: &[char] = &[
    '，', '。', ',', ':', '：', ';', '；', '、', '.', '!', '！', '？', '?', '（', '）', '(', ')', '[', ']', '{', '}',
    '<', '>', '《', '》', '"', '\'', '`', '~', '·', '-',
];

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("OcrParse: {0}")]
    Parse(String),
    #[error("MissingField: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrPoint {
    #[serde(rename = "X", alias = "x")]
    pub x: f64,
    #[serde(rename = "Y", alias = "y")]
    pub y: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrDetection {
    #[serde(rename = "DetectedText", alias = "text")]
    pub text: String,
    /// Provider score on a 0-100 scale.
    #[serde(rename = "Confidence", alias = "confidence", default)]
    pub confidence: Option<f64>,
    #[serde(rename = "Polygon", alias = "polygon", default)]
    pub polygon: Option<Vec<OcrPoint>>,
    /// Either a JSON-encoded string or an inline object carrying `Parag.ParagNo`.
    #[serde(rename = "AdvancedInfo", alias = "metadata", default)]
    pub advanced_info: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrResponse {
    #[serde(rename = "TextDetections", alias = "detections")]
    pub detections: Vec<OcrDetection>,
    #[serde(rename = "Angle", alias = "page_angle", default)]
    pub angle: Option<f64>,
    /// Deprecated provider spelling, sent alongside `Angle`.
    #[serde(rename = "Angel", default)]
    pub angel: Option<f64>,
}

impl OcrResponse {
    pub fn page_angle(&self) -> Option<f64> {
        self.angle.or(self.angel)
    }
}

/// Parse a provider response, wrapped in `Response` or bare.
pub fn parse_ocr_response(raw: &str) -> Result<OcrResponse, NormalizeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| NormalizeError::Parse(e.to_string()))?;
    let body = match value {
        Value::Object(mut obj) if obj.contains_key("Response") => obj.remove("Response").unwrap_or(Value::Null),
        other => other,
    };
    if body.get("TextDetections").is_none() && body.get("detections").is_none() {
        return Err(NormalizeError::MissingField("TextDetections"));
    }
    serde_json::from_value(body).map_err(|e| NormalizeError::Parse(e.to_string()))
}

/// Axis-aligned box over a polygon, corners rounded to whole pixels;
/// `None` for an empty polygon.
pub fn polygon_to_bbox(poly: &[OcrPoint]) -> Option<BoundingBox> {
    let first = poly.first()?;
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (first.x, first.x, first.y, first.y);
    for p in &poly[1..] {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    // float-to-int casts saturate
    let (x, y) = (min_x.round() as i64, min_y.round() as i64);
    Some(BoundingBox {
        x,
        y,
        width: (max_x.round() as i64).saturating_sub(x),
        height: (max_y.round() as i64).saturating_sub(y),
    })
}

pub fn has_checkbox_glyph(text: &str) -> bool {
    text.chars().any(|c| CHECKBOX_GLYPHS.contains(&c))
}

fn paragraph_id(info: Option<&Value>) -> Option<i64> {
    let parsed;
    let obj = match info? {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).ok()?;
            &parsed
        }
        other => other,
    };
    obj.get("Parag")?.get("ParagNo")?.as_i64()
}

/// Turn detections into a page of lines numbered 1..N in detection order.
pub fn detections_to_page(resp: &OcrResponse, page_number: Option<u32>, low_conf_threshold: f64) -> Page {
    let lines = resp
        .detections
        .iter()
        .enumerate()
        .map(|(idx, det)| {
            let confidence = det.confidence.map(|c| c / 100.0);
            let mut flags = Flags::default();
            if matches!(confidence, Some(c) if c < low_conf_threshold) {
                flags.set(flag::LOW_CONFIDENCE, true);
            }
            if has_checkbox_glyph(&det.text) {
                flags.set(flag::CHECKBOX_LIKE, true);
            }
            Line {
                line_id: (idx + 1) as u32,
                text: det.text.clone(),
                confidence,
                bounding_box: det.polygon.as_deref().and_then(polygon_to_bbox),
                paragraph_id: paragraph_id(det.advanced_info.as_ref()),
                flags,
            }
        })
        .collect();
    Page { page_number, lines }
}

pub fn normalize_ocr_json(raw: &str, page_number: Option<u32>, low_conf_threshold: f64) -> Result<Page, NormalizeError> {
    let resp = parse_ocr_response(raw)?;
    Ok(detections_to_page(&resp, page_number, low_conf_threshold))
}

/// Lowercased text without whitespace or common punctuation.
pub fn boilerplate_key(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && !BOILERPLATE_PUNCT.contains(c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Flag lines whose key recurs at least `repeat_threshold` times across the
/// whole document. Returns the number of lines flagged.
pub fn mark_boilerplate(doc: &mut Document, repeat_threshold: usize) -> usize {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (_, _, line) in doc.lines() {
        let key = boilerplate_key(&line.text);
        if key.is_empty() { continue; }
        *counts.entry(key).or_insert(0) += 1;
    }

    let mut marked = 0usize;
    for line in doc.sources.iter_mut().flat_map(|s| s.pages.iter_mut()).flat_map(|p| p.lines.iter_mut()) {
        let key = boilerplate_key(&line.text);
        if key.is_empty() { continue; }
        if counts.get(&key).copied().unwrap_or(0) >= repeat_threshold {
            line.flags.set(flag::BOILERPLATE, true);
            marked += 1;
        }
    }
    marked
}

pub fn checkbox_state_of(text: &str) -> Option<CheckboxState> {
    if text.chars().any(|c| CHECKED_GLYPHS.contains(&c)) {
        Some(CheckboxState::Checked)
    } else if text.chars().any(|c| UNCHECKED_GLYPHS.contains(&c)) {
        Some(CheckboxState::Unchecked)
    } else {
        None
    }
}

fn is_symbol_only(text: &str) -> bool {
    let stripped = strip_whitespace(text);
    !stripped.is_empty()
        && stripped.chars().all(|c| CHECKED_GLYPHS.contains(&c) || UNCHECKED_GLYPHS.contains(&c))
}

fn nearest_text_line(lines: &[Line], from: usize, candidates: &[usize], w: &LinkWeights) -> Option<usize> {
    let (sx, sy) = lines[from].center()?;
    let mut best: Option<(f64, usize)> = None;
    for &idx in candidates {
        let Some((cx, cy)) = lines[idx].center() else { continue };
        let dist = (cy - sy).abs() * w.row_weight + (cx - sx).abs() * w.column_weight;
        if best.map_or(true, |(d, _)| dist < d) {
            best = Some((dist, idx));
        }
    }
    best.map(|(_, idx)| idx)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageAnnotation {
    pub checkbox_lines: usize,
    pub links: usize,
    pub form_template: bool,
}

/// Checkbox and form-template annotation for one OCR page.
pub fn annotate_page(page: &mut Page, cfg: &EngineConfig) -> PageAnnotation {
    let mut out = PageAnnotation::default();
    let mut symbol_only: Vec<usize> = Vec::new();
    let mut text_bearing: Vec<usize> = Vec::new();

    for (idx, line) in page.lines.iter_mut().enumerate() {
        let text = line.text.trim();
        match checkbox_state_of(text) {
            Some(state) => {
                line.flags.set(flag::CHECKBOX_OPTION, true);
                line.flags.set(flag::CHECKBOX_STATE, state.as_str());
                out.checkbox_lines += 1;
                if is_symbol_only(text) { symbol_only.push(idx); } else { text_bearing.push(idx); }
            }
            None if !text.is_empty() => text_bearing.push(idx),
            None => {}
        }
    }

    // OCR may emit the tick mark and its label as separate detections.
    for &sym in &symbol_only {
        let Some(target) = nearest_text_line(&page.lines, sym, &text_bearing, &cfg.checkbox_link) else { continue };
        let source = &page.lines[sym];
        let state = source.flags.get_str(flag::CHECKBOX_STATE).unwrap_or("unknown").to_string();
        let from_id = source.line_id;
        let line = &mut page.lines[target];
        line.flags.set(flag::CHECKBOX_OPTION, true);
        line.flags.set(flag::CHECKBOX_STATE, state);
        line.flags.set(flag::CHECKBOX_LINKED_FROM, from_id);
        out.links += 1;
    }

    let keyword_hit = page.lines.iter().any(|l| contains_any(&l.text, FORM_TEMPLATE_KEYWORDS));
    out.form_template = out.checkbox_lines >= cfg.form_checkbox_min || keyword_hit;
    if out.form_template {
        for line in page.lines.iter_mut() {
            line.flags.set(flag::FORM_TEMPLATE, true);
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnnotationStats {
    pub form_pages: usize,
    pub checkbox_lines: usize,
    pub checkbox_links: usize,
    pub boilerplate_lines: usize,
}

/// Annotate a fully assembled document. Must run after every source is in
/// place since boilerplate counts span the whole document.
pub fn annotate_document(doc: &mut Document, cfg: &EngineConfig) -> AnnotationStats {
    let mut stats = AnnotationStats::default();
    for src in doc.sources.iter_mut().filter(|s| s.source_type.is_ocr_derived()) {
        for page in src.pages.iter_mut() {
            let a = annotate_page(page, cfg);
            stats.checkbox_lines += a.checkbox_lines;
            stats.checkbox_links += a.links;
            if a.form_template { stats.form_pages += 1; }
        }
    }
    stats.boilerplate_lines = mark_boilerplate(doc, cfg.boilerplate_repeat_threshold);
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Horizontal,
    Vertical,
}

/// Vertical when the median height/width ratio of boxed lines exceeds `vertical_ratio`.
pub fn detect_orientation(page: &Page, vertical_ratio: f64) -> Orientation {
    let mut ratios: Vec<f64> = page
        .lines
        .iter()
        .filter_map(|l| l.bounding_box.as_ref())
        .map(|b| b.height.max(1) as f64 / b.width.max(1) as f64)
        .collect();
    if ratios.is_empty() {
        return Orientation::Horizontal;
    }
    ratios.sort_by(|a, b| a.total_cmp(b));
    if ratios[ratios.len() / 2] > vertical_ratio { Orientation::Vertical } else { Orientation::Horizontal }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub section: Section,
    /// Index into `page.lines`.
    pub index: usize,
}

/// Lines matching the anchor table, first matching section per line.
/// Lines without geometry cannot anchor.
pub fn find_anchors(page: &Page) -> Vec<Anchor> {
    page.lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.bounding_box.is_some())
        .filter_map(|(index, l)| {
            let text = l.text.trim();
            if text.is_empty() {
                return None;
            }
            ANCHOR_KEYWORDS
                .iter()
                .find(|(_, keys)| contains_any(text, keys))
                .map(|(section, _)| Anchor { section: *section, index })
        })
        .collect()
}

/// Indices of the lowest-scoring neighbors inside the orientation window.
pub fn find_neighbors(page: &Page, anchor: usize, orientation: Orientation, cfg: &NeighborhoodConfig) -> Vec<usize> {
    let Some((ax, ay)) = page.lines[anchor].center() else { return Vec::new() };
    let window = match orientation {
        Orientation::Horizontal => &cfg.horizontal,
        Orientation::Vertical => &cfg.vertical,
    };

    let mut scored: Vec<(f64, usize)> = Vec::new();
    for (idx, line) in page.lines.iter().enumerate() {
        if idx == anchor { continue; }
        let Some((cx, cy)) = line.center() else { continue };
        let (dx, dy) = ((cx - ax).abs(), (cy - ay).abs());
        let (perp, par) = match orientation {
            Orientation::Horizontal => (dy, dx),
            Orientation::Vertical => (dx, dy),
        };
        if perp > window.max_perpendicular || par > window.max_parallel { continue; }
        scored.push((perp * window.perpendicular_weight + par * window.parallel_weight, idx));
    }
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));
    scored.truncate(cfg.max_neighbors);
    scored.into_iter().map(|(_, idx)| idx).collect()
}

/// Panel/assay vocabulary without any diagnostic or history words.
pub fn is_detection_noise(text: &str) -> bool {
    let clinical = ANCHOR_KEYWORDS
        .iter()
        .filter(|(s, _)| matches!(s, Section::Diagnosis | Section::MedicalHistory))
        .any(|(_, keys)| contains_any(text, keys));
    !clinical && contains_any(text, DETECTION_NOISE_KEYWORDS)
}

/// Neighbors of every anchor across the OCR pages of one source.
pub fn anchor_neighborhood_candidates(source: &Source, cfg: &EngineConfig) -> Vec<CandidateFact> {
    let mut out = Vec::new();
    if source.source_type.is_trusted() {
        return out;
    }
    for page in &source.pages {
        let anchors = find_anchors(page);
        if anchors.is_empty() { continue; }
        let orientation = detect_orientation(page, cfg.neighborhood.vertical_ratio);
        for anchor in anchors {
            for idx in find_neighbors(page, anchor.index, orientation, &cfg.neighborhood) {
                let line = &page.lines[idx];
                let text = line.text.trim();
                if text.is_empty() || is_detection_noise(text) || !admit_line(&line.flags, text, cfg) {
                    continue;
                }
                out.push(CandidateFact {
                    source_id: source.source_id.clone(),
                    page: page.page_number,
                    line_id: line.line_id,
                    quote: text.to_string(),
                    priority: Priority::High,
                    section_hints: anchored_hints(anchor.section, text),
                    flags: line.flags.clone(),
                });
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFact {
    pub source_id: String,
    pub page: Option<u32>,
    pub line_id: u32,
    pub quote: String,
    pub priority: Priority,
    pub section_hints: Vec<Section>,
    pub flags: Flags,
}

fn detected_sections(text: &str) -> Vec<Section> {
    SECTION_HINTS.iter().filter(|(_, words)| contains_any(text, words)).map(|(s, _)| *s).collect()
}

/// Section tags for a quote; `tests_and_exams` when nothing matches.
pub fn section_hints(text: &str) -> Vec<Section> {
    let hints = detected_sections(text);
    if hints.is_empty() { vec![Section::TestsAndExams] } else { hints }
}

fn anchored_hints(section: Section, text: &str) -> Vec<Section> {
    let mut hints = vec![section];
    hints.extend(detected_sections(text).into_iter().filter(|s| *s != section));
    hints
}

fn is_glyph_only(text: &str) -> bool {
    let stripped = strip_whitespace(text);
    !stripped.is_empty() && stripped.chars().count() <= 3 && stripped.chars().all(|c| GLYPH_ONLY_CHARS.contains(&c))
}

/// Content-admission rule shared by every OCR extraction path.
pub fn admit_line(flags: &Flags, text: &str, cfg: &EngineConfig) -> bool {
    if flags.is_unchecked_template() || flags.is_true(flag::BOILERPLATE) {
        return false;
    }
    if is_glyph_only(text) || is_detection_noise(text) {
        return false;
    }
    if contains_any(text, FORM_NOISE_KEYWORDS) && !text.chars().any(|c| CHECKED_GLYPHS.contains(&c)) {
        return false;
    }
    if flags.checkbox_state() == Some(CheckboxState::Checked) {
        return true;
    }
    if contains_any(text, PATIENT_SIGNAL_KEYWORDS) || contains_any(text, MEDICAL_SIGNAL_KEYWORDS) {
        return true;
    }
    text.chars().count() <= cfg.short_line_max_chars && text.chars().any(|c| c.is_ascii_digit())
}

fn dedup_key(source_id: &str, page: Option<u32>, text: &str) -> String {
    let page = page.map(|p| p.to_string()).unwrap_or_default();
    format!("{}:{}:{}", source_id, page, strip_whitespace(text).to_lowercase())
}

/// Ordered, deduplicated candidate facts for an annotated document.
pub fn build_candidate_facts(doc: &Document, cfg: &EngineConfig) -> Vec<CandidateFact> {
    let mut facts: Vec<CandidateFact> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |fact: CandidateFact, facts: &mut Vec<CandidateFact>| {
        if seen.insert(dedup_key(&fact.source_id, fact.page, &fact.quote)) {
            facts.push(fact);
        }
    };

    for source in &doc.sources {
        // Trusted text keeps full recall.
        let trusted = source.source_type.is_trusted();
        if !trusted {
            for fact in anchor_neighborhood_candidates(source, cfg) {
                push(fact, &mut facts);
            }
        }
        for page in &source.pages {
            for line in &page.lines {
                let text = line.text.trim();
                if text.is_empty() { continue; }
                if !trusted && !admit_line(&line.flags, text, cfg) { continue; }
                push(
                    CandidateFact {
                        source_id: source.source_id.clone(),
                        page: page.page_number,
                        line_id: line.line_id,
                        quote: text.to_string(),
                        priority: if trusted { Priority::High } else { Priority::Normal },
                        section_hints: section_hints(text),
                        flags: line.flags.clone(),
                    },
                    &mut facts,
                );
            }
        }
    }
    facts
}

/// SHA-256 over the compact JSON form of a candidate list.
pub fn candidate_fingerprint(facts: &[CandidateFact]) -> String {
    sha256_hex(&serde_json::to_vec(facts).unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Asserted,
    Negated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub source_id: String,
    pub page: Option<u32>,
    pub line_id: u32,
    pub quote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFact {
    pub text: String,
    pub polarity: Polarity,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub trusted_sources: usize,
    pub ocr_sources: usize,
    pub total_pages: usize,
    pub total_lines: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    pub warnings: Vec<String>,
    pub missing_critical: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseFacts {
    pub case_id: String,
    pub source_summary: SourceSummary,
    pub patient_info: Vec<RuleFact>,
    pub chief_complaint: Vec<RuleFact>,
    pub medical_history: Vec<RuleFact>,
    pub family_history: Vec<RuleFact>,
    pub tests_and_exams: Vec<RuleFact>,
    pub diagnosis: Vec<RuleFact>,
    pub quality: Quality,
}

pub const SALES_NOTES_FIELD: &str = "salesNotes";

pub fn detect_polarity(text: &str) -> Polarity {
    let compact = strip_whitespace(text);
    if compact.contains("☑无") || compact.contains("□无") || contains_any(text, NEGATION_HINTS) {
        Polarity::Negated
    } else {
        Polarity::Asserted
    }
}

/// Bucket every non-empty line of the document by keyword. Unchecked
/// template options are skipped entirely.
pub fn route_rule_facts(doc: &Document) -> CaseFacts {
    let mut case = CaseFacts { case_id: doc.case_id.clone(), ..CaseFacts::default() };

    for (source, page, line) in doc.lines() {
        let text = line.text.trim();
        if text.is_empty() || line.flags.is_unchecked_template() { continue; }
        let fact = RuleFact {
            text: text.to_string(),
            polarity: detect_polarity(text),
            evidence: vec![Evidence {
                source_id: source.source_id.clone(),
                page: page.page_number,
                line_id: line.line_id,
                quote: line.text.clone(),
            }],
        };

        if contains_any(text, ROUTE_DIAGNOSIS_HINTS) {
            case.diagnosis.push(fact.clone());
        } else if contains_any(text, ROUTE_EXAM_HINTS) {
            case.tests_and_exams.push(fact.clone());
        } else if text.contains("家族史") {
            case.family_history.push(fact.clone());
        } else if contains_any(text, ROUTE_HISTORY_HINTS) {
            case.medical_history.push(fact.clone());
        }

        if source.source_type.is_trusted() {
            if source.origin_field.as_deref() != Some(SALES_NOTES_FIELD) {
                case.chief_complaint.push(fact.clone());
            }
            case.patient_info.push(fact);
        }
    }

    case.source_summary = source_summary(doc);
    case.quality = quality_report(doc);
    case
}

pub fn source_summary(doc: &Document) -> SourceSummary {
    let mut s = SourceSummary::default();
    for src in &doc.sources {
        if src.source_type.is_trusted() { s.trusted_sources += 1; }
        if src.source_type.is_ocr_derived() { s.ocr_sources += 1; }
        s.total_pages += src.pages.len();
        s.total_lines += src.pages.iter().map(|p| p.lines.len()).sum::<usize>();
    }
    s
}

pub fn quality_report(doc: &Document) -> Quality {
    let mut q = Quality::default();
    let low_conf = doc.lines().filter(|(_, _, l)| l.flags.is_true(flag::LOW_CONFIDENCE)).count();
    if low_conf > 0 {
        q.warnings.push(format!("low_confidence_lines:{}", low_conf));
    }
    for src in &doc.sources {
        if let Some(err) = &src.error {
            q.warnings.push(format!("source_error:{}:{}", src.source_id, err));
        }
    }
    if !doc.sources.iter().any(|s| s.source_type.is_ocr_derived()) {
        q.missing_critical.push("no_ocr_attachment_source".to_string());
    }
    q
}

static ENGLISH_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]{3,}").unwrap());

fn is_unchecked_quote(quote: &str) -> bool {
    quote.contains('□') && !quote.chars().any(|c| CHECKED_GLYPHS.contains(&c))
}

// Case-level panel check; a chief complaint also counts as clinical context.
const FACT_CLINICAL_KEYWORDS: &[&str] = &["临床诊断", "诊断", "病史", "主诉"];

fn is_panel_noise_fact(text: &str) -> bool {
    contains_any(text, DETECTION_NOISE_KEYWORDS) && !contains_any(text, FACT_CLINICAL_KEYWORDS)
}

// Short abbreviations such as IVF/ICSI are fine; sentence-like English is not.
fn is_english_heavy(text: &str) -> bool {
    ENGLISH_WORD.find_iter(text).count() >= 4
}

/// Sanitize an assembled case regardless of which assembler produced it.
/// Returns the number of facts dropped.
pub fn apply_content_guardrails(case: &mut CaseFacts) -> usize {
    let mut dropped = 0usize;
    for bucket in [&mut case.diagnosis, &mut case.tests_and_exams] {
        let before = bucket.len();
        bucket.retain(|f| !f.evidence.iter().any(|e| is_unchecked_quote(&e.quote)) && !is_panel_noise_fact(&f.text));
        dropped += before - bucket.len();
    }
    for bucket in [
        &mut case.patient_info,
        &mut case.chief_complaint,
        &mut case.medical_history,
        &mut case.family_history,
        &mut case.tests_and_exams,
        &mut case.diagnosis,
    ] {
        let before = bucket.len();
        bucket.retain(|f| !is_english_heavy(&f.text));
        dropped += before - bucket.len();
    }
    dropped
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedField {
    pub name: String,
    pub text: String,
}

/// Record fields read as trusted text, in source order.
pub const TRUSTED_FIELDS: &[&str] = &[SALES_NOTES_FIELD, "otherInfo", "communicationInformation"];

#[derive(Debug, Error)]
pub enum TrustedTextError {
    #[error("FileNotFound: {0}")]
    Read(String),
    #[error("RecordParse: {0}")]
    Parse(String),
}

/// Read the trusted free-text fields from a raw record JSON. Missing or
/// non-string fields come back empty.
pub fn load_trusted_fields(path: &Path) -> Result<Vec<TrustedField>, TrustedTextError> {
    let raw = std::fs::read_to_string(path).map_err(|e| TrustedTextError::Read(format!("{}: {}", path.display(), e)))?;
    let record: Value = serde_json::from_str(&raw).map_err(|e| TrustedTextError::Parse(e.to_string()))?;
    Ok(TRUSTED_FIELDS
        .iter()
        .map(|name| TrustedField {
            name: name.to_string(),
            text: record.get(*name).and_then(Value::as_str).unwrap_or_default().to_string(),
        })
        .collect())
}

pub fn trusted_text_sources(fields: &[TrustedField]) -> Vec<Source> {
    fields
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let mut src = Source::new(format!("lims_text_{}", idx + 1), SourceType::TrustedText);
            src.origin_field = Some(field.name.clone());
            src.pages.push(Page {
                page_number: None,
                lines: vec![Line {
                    line_id: 1,
                    text: field.text.clone(),
                    confidence: Some(1.0),
                    bounding_box: None,
                    paragraph_id: None,
                    flags: Flags::default(),
                }],
            });
            src
        })
        .collect()
}

/// Split an OCR result stem `<attachment>_p<N>` into attachment and page.
pub fn parse_page_stem(stem: &str) -> Option<(String, Option<u32>)> {
    let (attachment, page) = stem.rsplit_once("_p")?;
    if attachment.is_empty() {
        return None;
    }
    Some((attachment.to_string(), page.parse::<u32>().ok()))
}

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("NoFilesFound")]
    NoFilesFound { guidance: String },
}

/// Enumerate OCR result JSON files using a glob pattern (e.g., "./ocr_results/**/*.json").
/// Returns a sorted list of paths.
pub fn enumerate_ocr_results(glob_pattern: &str) -> Result<Vec<PathBuf>, EnumerateError> {
    let root = if Path::new(glob_pattern).is_absolute() { "/" } else { "." };
    let pat = glob_pattern.trim_start_matches("./");
    let mut paths: Vec<PathBuf> = GlobWalkerBuilder::from_patterns(root, &[pat])
        .case_insensitive(false)
        .follow_links(false)
        .build()
        .map_err(|_| EnumerateError::NoFilesFound { guidance: folder_guidance() })?
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .collect();

    paths.sort();
    paths.retain(|p| p.is_file());

    if paths.is_empty() {
        return Err(EnumerateError::NoFilesFound { guidance: folder_guidance() });
    }
    Ok(paths)
}

fn folder_guidance() -> String {
    let guide = r#"No OCR results match the pattern.
Expected one JSON file per page, named <attachment>_p<N>.json:
  ./ocr_results/<case_id>/report_p1.json
  ./ocr_results/<case_id>/report_p2.json"#;
    guide.to_string()
}

/// Build the document for one case from trusted fields and OCR page files,
/// then annotate it. Unreadable pages mark their source with an error and
/// the rest of the source is kept.
pub fn assemble_document(case_id: &str, trusted: &[TrustedField], ocr_files: &[PathBuf], cfg: &EngineConfig) -> Document {
    let mut doc = Document::new(case_id);
    doc.sources.extend(trusted_text_sources(trusted));

    let mut ocr_sources: Vec<Source> = Vec::new();
    let mut by_attachment: HashMap<String, usize> = HashMap::new();
    for file in ocr_files {
        let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else { continue };
        let Some((attachment, page_number)) = parse_page_stem(stem) else { continue };
        let slot = *by_attachment.entry(attachment.clone()).or_insert_with(|| {
            ocr_sources.push(Source::new(format!("{}/{}", case_id, attachment), SourceType::OcrAttachment));
            ocr_sources.len() - 1
        });
        let source = &mut ocr_sources[slot];

        let raw = match std::fs::read_to_string(file) {
            Ok(raw) => raw,
            Err(e) => {
                source.record_error(&format!("read_failed: {}: {}", stem, e));
                continue;
            }
        };
        match normalize_ocr_json(&raw, page_number, cfg.low_confidence_threshold) {
            Ok(page) => source.pages.push(page),
            Err(e) => source.record_error(&format!("parse_failed: {}: {}", stem, e)),
        }
    }
    for source in ocr_sources.iter_mut() {
        source.pages.sort_by_key(|p| p.page_number.unwrap_or(0));
    }
    doc.sources.extend(ocr_sources);

    annotate_document(&mut doc, cfg);
    doc
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("WriteFailed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitPaths {
    pub ir_path: String,
    pub candidates_path: String,
    pub case_path: String,
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EmitError> {
    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    std::fs::write(&tmp, bytes).map_err(|e| EmitError::WriteFailed(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| EmitError::WriteFailed(e.to_string()))
}

/// Atomically write the IR, candidate facts and rule case into outdir with the case id as stem.
pub fn emit_outputs(doc: &Document, candidates: &[CandidateFact], case: &CaseFacts, outdir: &str) -> Result<EmitPaths, EmitError> {
    std::fs::create_dir_all(outdir).map_err(|e| EmitError::WriteFailed(e.to_string()))?;
    let stem = doc.case_id.replace('/', "_");
    let ir_path = Path::new(outdir).join(format!("{}_normalized_ir.json", stem));
    let candidates_path = Path::new(outdir).join(format!("{}_candidate_facts.json", stem));
    let case_path = Path::new(outdir).join(format!("{}_case.json", stem));

    let to_bytes = |v: serde_json::Result<Vec<u8>>| v.map_err(|e| EmitError::WriteFailed(e.to_string()));
    write_atomic(&ir_path, &to_bytes(serde_json::to_vec_pretty(doc))?)?;
    write_atomic(&candidates_path, &to_bytes(serde_json::to_vec_pretty(candidates))?)?;
    write_atomic(&case_path, &to_bytes(serde_json::to_vec_pretty(case))?)?;

    Ok(EmitPaths {
        ir_path: ir_path.to_string_lossy().to_string(),
        candidates_path: candidates_path.to_string_lossy().to_string(),
        case_path: case_path.to_string_lossy().to_string(),
    })
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{:02x}", b)).collect()
}
