//! Application metadata table
//!
//! Loads the categorisation daemon's application list from a CSV of
//! ten columns: guid, index, name, description, category,
//! productivity, risk, flags, reference, plugin. The first row is a
//! header. Malformed rows are skipped and malformed numeric fields
//! default to zero; neither is fatal.

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};

/// Details for one known application
#[derive(Debug, Clone, Default)]
pub struct ApplicationInfo {
    pub guid: String,
    pub index: i32,
    pub name: String,
    pub description: String,
    pub category: String,
    pub productivity: i32,
    pub risk: i32,
    pub flags: u64,
    pub reference: String,
    pub plugin: String,
}

/// Load the application table from disk
///
/// A missing or unreadable file is logged and yields an empty table;
/// classification then proceeds without names and categories.
pub fn load_application_table(path: &Path) -> HashMap<String, ApplicationInfo> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!("unable to load application details {}: {}", path.display(), err);
            return HashMap::new();
        }
    };

    let table = parse_application_table(&content);
    info!("loaded classification details for {} applications", table.len());
    table
}

fn parse_int(field: &str, what: &str) -> i32 {
    field.parse().unwrap_or_else(|_| {
        warn!("invalid {}: {}", what, field);
        0
    })
}

/// Parse CSV content into the guid-keyed table
pub(crate) fn parse_application_table(content: &str) -> HashMap<String, ApplicationInfo> {
    let mut table = HashMap::new();
    let mut linecount = 0usize;

    for line in content.lines() {
        linecount += 1;

        // the first line holds the file format description
        if linecount == 1 {
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 10 {
            warn!("invalid line length: {}", fields.len());
            continue;
        }

        let info = ApplicationInfo {
            guid: fields[0].to_string(),
            index: parse_int(fields[1], "index"),
            name: fields[2].to_string(),
            description: fields[3].to_string(),
            category: fields[4].to_string(),
            productivity: parse_int(fields[5], "productivity"),
            risk: parse_int(fields[6], "risk"),
            flags: fields[7].parse().unwrap_or_else(|_| {
                warn!("invalid flags: {}", fields[7]);
                0
            }),
            reference: fields[8].to_string(),
            plugin: fields[9].to_string(),
        };

        table.insert(fields[0].to_string(), info);
    }

    table
}
