//! `stratbox validate`

use super::{Verdict, label, read_source};
use crate::console::CliConsole;
use serde::Serialize;
use std::path::{Path, PathBuf};
use stratbox_core::{SandboxConfig, StaticValidator, ValidationPolicy, ValidationReport};

#[derive(Serialize)]
struct FileReport<'a> {
    file: &'a Path,
    report: &'a ValidationReport,
}

pub fn validate(
    config: &SandboxConfig,
    files: &[PathBuf],
    strict: bool,
    json: bool,
) -> anyhow::Result<Verdict> {
    let policy = if strict {
        ValidationPolicy::strict()
    } else {
        config.validation.clone()
    };
    let validator = StaticValidator::new(policy);

    let mut reports = Vec::with_capacity(files.len());
    for file in files {
        let source = read_source(file)?;
        reports.push((file, validator.validate(&source)));
    }

    if json {
        let entries: Vec<FileReport<'_>> = reports
            .iter()
            .map(|(file, report)| FileReport {
                file: file.as_path(),
                report,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        let console = CliConsole;
        for (file, report) in &reports {
            console.print_report(&label(file), report);
        }
    }

    Ok(Verdict::from_all(
        reports.iter().all(|(_, report)| report.safe()),
    ))
}
