use std::path::Path;

use ykcase_ir::{
    apply_content_guardrails, assemble_document, build_candidate_facts, candidate_fingerprint, emit_outputs,
    enumerate_ocr_results, load_config, load_trusted_fields, route_rule_facts, EngineConfig, EnumerateError,
    TrustedField,
};

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).filter(|v| !v.starts_with("--")).cloned()
}

fn main() {
    // Simple CLI flags parsing
    let args: Vec<String> = std::env::args().collect();
    let case_id = match arg_value(&args, "--case") {
        Some(c) => c,
        None => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool": "args",
                    "error": "missing --case",
                    "error_code": 3
                })
            );
            eprintln!("Usage: ykcase-ir --case <id> [--ocr-glob <glob>] [--raw <record.json>] [--out <dir>] [--config <yaml>]");
            std::process::exit(3);
        }
    };
    let ocr_glob = arg_value(&args, "--ocr-glob").unwrap_or_else(|| format!("./ocr_results/{}/*.json", case_id));
    let out_dir = arg_value(&args, "--out").unwrap_or_else(|| "./outputs".to_string());
    let config_path = arg_value(&args, "--config").unwrap_or_else(|| "ykcase.yaml".to_string());

    // 1) Engine config; defaults when no file is present
    let cfg = if Path::new(&config_path).exists() {
        match load_config(Path::new(&config_path)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "load_config",
                        "file": config_path,
                        "error": e.to_string(),
                        "error_code": 3
                    })
                );
                std::process::exit(3);
            }
        }
    } else {
        EngineConfig::default()
    };
    eprintln!(
        "{}",
        serde_json::json!({
            "tool": "load_config",
            "file": config_path,
            "status": "ok",
            "low_confidence_threshold": cfg.low_confidence_threshold,
            "boilerplate_repeat_threshold": cfg.boilerplate_repeat_threshold
        })
    );

    // 2) Trusted record fields
    let trusted: Vec<TrustedField> = match arg_value(&args, "--raw") {
        Some(raw) => match load_trusted_fields(Path::new(&raw)) {
            Ok(fields) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "load_trusted_fields",
                        "file": raw,
                        "fields": fields.len()
                    })
                );
                fields
            }
            Err(e) => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "tool": "load_trusted_fields",
                        "file": raw,
                        "error": e.to_string(),
                        "error_code": 2
                    })
                );
                std::process::exit(2);
            }
        },
        None => Vec::new(),
    };

    // 3) OCR page results
    let ocr_files = match enumerate_ocr_results(&ocr_glob) {
        Ok(files) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool": "enumerate_ocr_results",
                    "pattern": ocr_glob,
                    "count": files.len()
                })
            );
            files
        }
        Err(EnumerateError::NoFilesFound { guidance }) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool": "enumerate_ocr_results",
                    "pattern": ocr_glob,
                    "error": "NoFilesFound",
                    "error_code": 1
                })
            );
            if trusted.is_empty() {
                eprintln!("{}", guidance);
                std::process::exit(1);
            }
            Vec::new()
        }
    };

    // 4) Assemble + annotate
    let doc = assemble_document(&case_id, &trusted, &ocr_files, &cfg);
    let failed: Vec<&str> = doc.sources.iter().filter(|s| s.error.is_some()).map(|s| s.source_id.as_str()).collect();
    eprintln!(
        "{}",
        serde_json::json!({
            "tool": "assemble_document",
            "case_id": doc.case_id,
            "sources": doc.sources.len(),
            "lines": doc.lines().count(),
            "failed_sources": failed
        })
    );

    // 5) Candidate facts
    let candidates = build_candidate_facts(&doc, &cfg);
    eprintln!(
        "{}",
        serde_json::json!({
            "tool": "build_candidate_facts",
            "case_id": doc.case_id,
            "count": candidates.len(),
            "fingerprint": candidate_fingerprint(&candidates)
        })
    );

    // 6) Rule routing
    let mut case = route_rule_facts(&doc);
    let dropped = apply_content_guardrails(&mut case);
    eprintln!(
        "{}",
        serde_json::json!({
            "tool": "route_rule_facts",
            "case_id": doc.case_id,
            "diagnosis": case.diagnosis.len(),
            "tests_and_exams": case.tests_and_exams.len(),
            "medical_history": case.medical_history.len(),
            "family_history": case.family_history.len(),
            "chief_complaint": case.chief_complaint.len(),
            "patient_info": case.patient_info.len(),
            "guardrail_dropped": dropped,
            "warnings": case.quality.warnings
        })
    );

    // 7) Emit files (atomic)
    match emit_outputs(&doc, &candidates, &case, &out_dir) {
        Ok(paths) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool": "emit_outputs",
                    "ir_path": paths.ir_path,
                    "candidates_path": paths.candidates_path,
                    "case_path": paths.case_path
                })
            );
        }
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::json!({
                    "tool": "emit_outputs",
                    "error": e.to_string(),
                    "error_code": 6
                })
            );
            std::process::exit(6);
        }
    }
}
