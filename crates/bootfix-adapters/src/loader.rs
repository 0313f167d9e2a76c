//! Target list loading.
//!
//! Accepts a JSON array of `{Subscription, ResourceGroup, VmName}` objects or
//! a headered CSV file with the same three columns in any order.

use anyhow::{bail, Context, Result};
use bootfix_core::TargetRecord;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

const COLUMNS: [&str; 3] = ["Subscription", "ResourceGroup", "VmName"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRecord {
    #[serde(rename = "Subscription")]
    subscription: String,
    #[serde(rename = "ResourceGroup")]
    resource_group: String,
    #[serde(rename = "VmName")]
    vm_name: String,
}

/// Read the target list at `path`, skipping records with an empty field.
pub fn load_targets(path: &Path) -> Result<Vec<TargetRecord>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read target list '{}'", path.display()))?;
    let raw = if looks_like_json(&content) {
        serde_json::from_str::<Vec<RawRecord>>(&content)
            .with_context(|| format!("Failed to parse target list '{}'", path.display()))?
    } else {
        parse_csv(&content)
            .with_context(|| format!("Failed to parse target list '{}'", path.display()))?
    };
    Ok(keep_complete(raw))
}

fn looks_like_json(content: &str) -> bool {
    content.trim_start().starts_with('[')
}

fn parse_csv(content: &str) -> Result<Vec<RawRecord>> {
    let mut lines = content
        .lines()
        .map(|line| line.trim_start_matches('\u{feff}').trim())
        .filter(|line| !line.is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };

    let headers: Vec<&str> = header.split(',').map(str::trim).collect();
    let mut index = [0usize; 3];
    for (slot, column) in index.iter_mut().zip(COLUMNS) {
        *slot = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(column))
            .with_context(|| format!("Missing '{}' column in header", column))?;
    }

    let mut records = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < headers.len() {
            bail!(
                "Row {} has {} fields, expected {}",
                line_no + 2,
                fields.len(),
                headers.len()
            );
        }
        records.push(RawRecord {
            subscription: fields[index[0]].to_string(),
            resource_group: fields[index[1]].to_string(),
            vm_name: fields[index[2]].to_string(),
        });
    }
    Ok(records)
}

fn keep_complete(raw: Vec<RawRecord>) -> Vec<TargetRecord> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(i, r)| {
            let subscription = r.subscription.trim();
            let resource_group = r.resource_group.trim();
            let vm_name = r.vm_name.trim();
            if subscription.is_empty() || resource_group.is_empty() || vm_name.is_empty() {
                warn!(
                    record = i + 1,
                    subscription,
                    resource_group,
                    vm = vm_name,
                    "Skipping target with an empty field"
                );
                return None;
            }
            Some(TargetRecord::new(subscription, resource_group, vm_name))
        })
        .collect()
}
