use std::io::{self, Write};

use serde::Serialize;

use crate::app::{AuditResult, FetchResult, IdsResult, InfoResult, ProgressEvent, ProgressSink};
use crate::batch::RunReport;
use crate::report::{ReportResult, RunlistResult};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_ids(result: &IdsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_audit(result: &AuditResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_run(result: &RunReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_runlist(result: &RunlistResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(result: &ReportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
