//! Read-only listings of identities and the unresolved backlog.

use crate::domain::{Detection, Identity};
use crate::error::{Error, Result};
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct IdentityRow<'a> {
    id: u64,
    partition: &'a str,
    first_observed: String,
    last_observed: String,
    observation_count: u64,
}

#[derive(Serialize)]
struct PendingRow<'a> {
    detection_id: u64,
    image_id: u64,
    label: &'a str,
    state: &'a str,
    attempts: u32,
    last_error: Option<&'a str>,
}

fn identity_rows(identities: &[Identity]) -> Vec<IdentityRow<'_>> {
    identities
        .iter()
        .map(|i| IdentityRow {
            id: i.id.0,
            partition: i.partition.as_str(),
            first_observed: i.first_observed.to_rfc3339(),
            last_observed: i.last_observed.to_rfc3339(),
            observation_count: i.observation_count,
        })
        .collect()
}

fn pending_rows(detections: &[Detection]) -> Vec<PendingRow<'_>> {
    detections
        .iter()
        .map(|d| PendingRow {
            detection_id: d.id.0,
            image_id: d.image_id.0,
            label: d.classification.as_str(),
            state: d.state.as_str(),
            attempts: d.attempts,
            last_error: d.last_error.as_deref(),
        })
        .collect()
}

fn write_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| Error::OutputSerialize { source: e })?;
    writeln!(out, "{json}")?;
    Ok(())
}

/// Write identities as a table or JSON.
pub fn write_identities(out: &mut impl Write, identities: &[Identity], json: bool) -> Result<()> {
    let rows = identity_rows(identities);
    if json {
        return write_json(out, &rows);
    }

    if rows.is_empty() {
        writeln!(out, "No identities.")?;
        return Ok(());
    }
    writeln!(
        out,
        "{:>8}  {:<14}  {:<25}  {:<25}  {:>6}",
        "ID", "PARTITION", "FIRST SEEN", "LAST SEEN", "SEEN"
    )?;
    for row in &rows {
        writeln!(
            out,
            "{:>8}  {:<14}  {:<25}  {:<25}  {:>6}",
            row.id, row.partition, row.first_observed, row.last_observed, row.observation_count
        )?;
    }
    Ok(())
}

/// Write unresolved detections as a table or JSON.
pub fn write_pending(out: &mut impl Write, detections: &[Detection], json: bool) -> Result<()> {
    let rows = pending_rows(detections);
    if json {
        return write_json(out, &rows);
    }

    if rows.is_empty() {
        writeln!(out, "No unresolved detections.")?;
        return Ok(());
    }
    writeln!(
        out,
        "{:>10}  {:>8}  {:<16}  {:<14}  {:>8}  ERROR",
        "DETECTION", "IMAGE", "LABEL", "STATE", "ATTEMPTS"
    )?;
    for row in &rows {
        writeln!(
            out,
            "{:>10}  {:>8}  {:<16}  {:<14}  {:>8}  {}",
            row.detection_id,
            row.image_id,
            row.label,
            row.state,
            row.attempts,
            row.last_error.unwrap_or("-")
        )?;
    }
    Ok(())
}
