use ykcase_ir::{flag, normalize_ocr_json, parse_ocr_response, polygon_to_bbox, BoundingBox, NormalizeError, OcrPoint};

#[test]
fn wrapped_provider_response_becomes_numbered_lines() {
    let raw = r#"{
        "Response": {
            "TextDetections": [
                {
                    "DetectedText": "姓名：张三",
                    "Confidence": 95,
                    "Polygon": [{"X": 10, "Y": 20}, {"X": 110, "Y": 20}, {"X": 110, "Y": 50}, {"X": 10, "Y": 50}],
                    "AdvancedInfo": "{\"Parag\":{\"ParagNo\":3}}"
                },
                {
                    "DetectedText": "□ 是",
                    "Confidence": 40,
                    "Polygon": [{"X": 5, "Y": 60}, {"X": 25, "Y": 62}, {"X": 24, "Y": 80}]
                }
            ],
            "Angle": 0.5
        }
    }"#;
    let page = normalize_ocr_json(raw, Some(2), 0.6).expect("valid response");
    assert_eq!(page.page_number, Some(2));
    assert_eq!(page.lines.len(), 2);

    let first = &page.lines[0];
    assert_eq!(first.line_id, 1);
    assert!((first.confidence.unwrap() - 0.95).abs() < 1e-9);
    assert_eq!(first.bounding_box, Some(BoundingBox { x: 10, y: 20, width: 100, height: 30 }));
    assert_eq!(first.paragraph_id, Some(3));
    assert!(first.flags.is_empty());

    let second = &page.lines[1];
    assert_eq!(second.line_id, 2);
    assert!(second.flags.is_true(flag::LOW_CONFIDENCE));
    assert!(second.flags.is_true(flag::CHECKBOX_LIKE));
    assert_eq!(second.bounding_box, Some(BoundingBox { x: 5, y: 60, width: 20, height: 20 }));
    assert_eq!(second.paragraph_id, None);
}

#[test]
fn bare_response_with_generic_keys_and_inline_metadata() {
    let raw = r#"{
        "detections": [
            {"text": "临床诊断", "confidence": 88.5, "polygon": [{"x": 1, "y": 2}, {"x": 9, "y": 12}],
             "metadata": {"Parag": {"ParagNo": 7}}}
        ],
        "page_angle": 90
    }"#;
    let resp = parse_ocr_response(raw).expect("valid");
    assert_eq!(resp.page_angle(), Some(90.0));
    let page = normalize_ocr_json(raw, None, 0.6).unwrap();
    assert_eq!(page.lines[0].text, "临床诊断");
    assert_eq!(page.lines[0].paragraph_id, Some(7));
    assert_eq!(page.lines[0].bounding_box, Some(BoundingBox { x: 1, y: 2, width: 8, height: 10 }));
}

#[test]
fn empty_polygon_and_bad_metadata_are_tolerated() {
    let raw = r#"{"TextDetections": [
        {"DetectedText": "无框文本", "Polygon": [], "AdvancedInfo": "not json"},
        {"DetectedText": "也无框"}
    ]}"#;
    let page = normalize_ocr_json(raw, Some(1), 0.6).unwrap();
    assert!(page.lines.iter().all(|l| l.bounding_box.is_none()));
    assert!(page.lines.iter().all(|l| l.paragraph_id.is_none()));
    // no provider score means no low-confidence flag
    assert!(page.lines.iter().all(|l| l.confidence.is_none() && !l.flags.is_true(flag::LOW_CONFIDENCE)));
}

#[test]
fn threshold_is_exclusive() {
    let raw = r#"{"TextDetections": [{"DetectedText": "a", "Confidence": 60}]}"#;
    let page = normalize_ocr_json(raw, Some(1), 0.6).unwrap();
    assert!(!page.lines[0].flags.is_true(flag::LOW_CONFIDENCE));
}

#[test]
fn structural_errors_surface_to_caller() {
    match normalize_ocr_json(r#"{"Response": {"Angle": 0}}"#, Some(1), 0.6) {
        Err(NormalizeError::MissingField(f)) => assert_eq!(f, "TextDetections"),
        other => panic!("expected MissingField, got {:?}", other),
    }
    assert!(matches!(normalize_ocr_json("{not json", Some(1), 0.6), Err(NormalizeError::Parse(_))));
    let no_text = r#"{"TextDetections": [{"Confidence": 99}]}"#;
    assert!(matches!(normalize_ocr_json(no_text, Some(1), 0.6), Err(NormalizeError::Parse(_))));
}

#[test]
fn provider_response_with_both_angle_spellings() {
    let raw = r#"{"Response": {
        "TextDetections": [{"DetectedText": "孕2产0", "Confidence": 99,
            "Polygon": [{"X": 0, "Y": 0}, {"X": 50, "Y": 0}, {"X": 50, "Y": 20}, {"X": 0, "Y": 20}]}],
        "Angel": 0.0,
        "Angle": 1.5,
        "PdfPageSize": 0,
        "RequestId": "c5a1f0e2-7d3b-4e9a-9a51-000000000000"
    }}"#;
    let resp = parse_ocr_response(raw).expect("both spellings accepted");
    assert_eq!(resp.page_angle(), Some(1.5));
    let page = normalize_ocr_json(raw, Some(1), 0.6).unwrap();
    assert_eq!(page.lines[0].text, "孕2产0");

    let old_only = r#"{"TextDetections": [], "Angel": 2.0}"#;
    assert_eq!(parse_ocr_response(old_only).unwrap().page_angle(), Some(2.0));
}

#[test]
fn fractional_and_extreme_coordinates_still_box() {
    let raw = r#"{"TextDetections": [{"DetectedText": "结论", "Polygon": [{"X": 1.5, "Y": 2}, {"X": 9, "Y": 12.4}]}]}"#;
    let page = normalize_ocr_json(raw, Some(1), 0.6).expect("fractional polygon");
    assert_eq!(page.lines[0].bounding_box, Some(BoundingBox { x: 2, y: 2, width: 7, height: 10 }));

    let wide = [OcrPoint { x: -1e300, y: 0.0 }, OcrPoint { x: 1e300, y: 10.0 }];
    let b = polygon_to_bbox(&wide).unwrap();
    assert_eq!(b.x, i64::MIN);
    assert_eq!(b.width, i64::MAX);
    assert_eq!(b.height, 10);
}
