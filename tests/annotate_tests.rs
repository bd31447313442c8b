use std::collections::BTreeSet;

use ykcase_ir::{
    annotate_document, annotate_page, boilerplate_key, flag, mark_boilerplate, trusted_text_sources, BoundingBox,
    Document, EngineConfig, Flags, Line, Page, Source, SourceType, TrustedField,
};

fn line(id: u32, text: &str, bbox: Option<(i64, i64, i64, i64)>) -> Line {
    Line {
        line_id: id,
        text: text.to_string(),
        confidence: Some(0.99),
        bounding_box: bbox.map(|(x, y, width, height)| BoundingBox { x, y, width, height }),
        paragraph_id: None,
        flags: Flags::default(),
    }
}

fn ocr_source(id: &str, pages: Vec<Page>) -> Source {
    let mut s = Source::new(id, SourceType::OcrAttachment);
    s.pages = pages;
    s
}

#[test]
fn dense_checkbox_page_is_a_form_template() {
    let mut page = Page {
        page_number: Some(1),
        lines: vec![
            line(1, "□ 既往病史", None),
            line(2, "☑ 无家族遗传病史", None),
            line(3, "□ 高血压", None),
            line(4, "☑ 糖尿病", None),
            line(5, "■ 其他", None),
            line(6, "备注", None),
        ],
    };
    let a = annotate_page(&mut page, &EngineConfig::default());
    assert_eq!(a.checkbox_lines, 5);
    assert!(a.form_template);
    assert!(page.lines.iter().all(|l| l.flags.is_true(flag::FORM_TEMPLATE)));
    assert_eq!(page.lines[0].flags.get_str(flag::CHECKBOX_STATE), Some("unchecked"));
    assert!(page.lines[0].flags.is_unchecked_template());
    assert_eq!(page.lines[1].flags.get_str(flag::CHECKBOX_STATE), Some("checked"));
    assert!(page.lines[1].flags.is_true(flag::CHECKBOX_OPTION));
    assert!(page.lines[5].flags.get(flag::CHECKBOX_STATE).is_none());
}

#[test]
fn sparse_checkbox_page_is_not_a_form() {
    let mut page = Page { page_number: Some(1), lines: vec![line(1, "□ 高血压", None), line(2, "主诉：流产", None)] };
    let a = annotate_page(&mut page, &EngineConfig::default());
    assert!(!a.form_template);
    assert!(!page.lines[0].flags.is_unchecked_template());
}

#[test]
fn form_keyword_marks_whole_page() {
    let mut page = Page { page_number: Some(1), lines: vec![line(1, "遗传检测知情同意书", None), line(2, "患者签名", None)] };
    assert!(annotate_page(&mut page, &EngineConfig::default()).form_template);
    assert!(page.lines[1].flags.is_true(flag::FORM_TEMPLATE));
}

#[test]
fn symbol_only_tick_links_to_same_row_label() {
    let mut page = Page {
        page_number: Some(1),
        lines: vec![
            line(1, "☑", Some((100, 100, 20, 20))),
            line(2, "高血压", Some((130, 100, 80, 20))),
            line(3, "糖尿病", Some((100, 160, 80, 20))),
        ],
    };
    let a = annotate_page(&mut page, &EngineConfig::default());
    assert_eq!(a.links, 1);
    let label = &page.lines[1];
    assert_eq!(label.flags.get_str(flag::CHECKBOX_STATE), Some("checked"));
    assert_eq!(label.flags.get(flag::CHECKBOX_LINKED_FROM).and_then(|v| v.as_u64()), Some(1));
    assert!(page.lines[2].flags.get(flag::CHECKBOX_STATE).is_none());
}

#[test]
fn symbol_without_geometry_is_left_unlinked() {
    let mut page = Page {
        page_number: Some(1),
        lines: vec![line(1, "□", None), line(2, "高血压", Some((130, 100, 80, 20)))],
    };
    let a = annotate_page(&mut page, &EngineConfig::default());
    assert_eq!(a.links, 0);
    assert!(page.lines[1].flags.get(flag::CHECKBOX_LINKED_FROM).is_none());
}

#[test]
fn trusted_text_is_exempt_from_checkbox_pass() {
    let mut doc = Document::new("C1");
    doc.sources = trusted_text_sources(&[TrustedField { name: "otherInfo".into(), text: "□ 高血压".into() }]);
    annotate_document(&mut doc, &EngineConfig::default());
    let (_, _, l) = doc.lines().next().unwrap();
    assert!(!l.flags.is_true(flag::CHECKBOX_OPTION));
}

#[test]
fn boilerplate_key_ignores_case_space_and_punctuation() {
    assert_eq!(boilerplate_key("XX医院 检验科。"), boilerplate_key("xx医院检验科"));
    assert_eq!(boilerplate_key(" ，。 "), "");
}

fn three_sources() -> Vec<Source> {
    vec![
        ocr_source("C1/a", vec![Page { page_number: Some(1), lines: vec![line(1, "XX医院检验科", None), line(2, "主诉：流产", None)] }]),
        ocr_source("C1/b", vec![Page { page_number: Some(1), lines: vec![line(1, "xx医院 检验科。", None), line(2, "孕2产0", None)] }]),
        ocr_source("C1/c", vec![
            Page { page_number: Some(1), lines: vec![line(1, "XX医院检验科", None)] },
            Page { page_number: Some(2), lines: vec![line(1, "孕2产0", None)] },
        ]),
    ]
}

fn flagged(doc: &Document) -> BTreeSet<(String, Option<u32>, u32)> {
    doc.lines()
        .filter(|(_, _, l)| l.flags.is_true(flag::BOILERPLATE))
        .map(|(s, p, l)| (s.source_id.clone(), p.page_number, l.line_id))
        .collect()
}

#[test]
fn boilerplate_uses_document_wide_counts() {
    let mut doc = Document::new("C1");
    doc.sources = three_sources();
    assert_eq!(mark_boilerplate(&mut doc, 3), 3);
    let set = flagged(&doc);
    assert!(set.contains(&("C1/b".to_string(), Some(1), 1)));
    // two occurrences stay below the threshold
    assert!(!set.iter().any(|(s, _, id)| s == "C1/b" && *id == 2));
}

#[test]
fn boilerplate_is_independent_of_source_order() {
    let mut forward = Document::new("C1");
    forward.sources = three_sources();
    let mut reversed = Document::new("C1");
    reversed.sources = three_sources().into_iter().rev().collect();

    mark_boilerplate(&mut forward, 3);
    mark_boilerplate(&mut reversed, 3);
    assert_eq!(flagged(&forward), flagged(&reversed));
}
