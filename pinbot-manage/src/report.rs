//! Plain-text rendering for `status`.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use pinbot::cid::Cid;
use pinbot::pin::{PinRecord, PinStatus};

/// Remaining window as `2d 3h`, `5h 12m`, `42m` or `<1m`.
pub fn format_time_left(record: &PinRecord, now: DateTime<Utc>) -> String {
    match record.status {
        PinStatus::Unpinned => return "-".to_string(),
        PinStatus::Expired => return "expired".to_string(),
        PinStatus::Active => {}
    }
    let Some(left) = record.time_left(now) else {
        return "expired".to_string();
    };
    format_duration(left)
}

fn format_duration(d: Duration) -> String {
    let days = d.num_days();
    let hours = d.num_hours() % 24;
    let minutes = d.num_minutes() % 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        "<1m".to_string()
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Render records as an aligned table. `sizes` adds a SIZE column.
pub fn render_table(
    records: &[PinRecord],
    now: DateTime<Utc>,
    sizes: Option<&HashMap<Cid, u64>>,
) -> String {
    if records.is_empty() {
        return "No pins tracked.\n".to_string();
    }

    let mut header = vec!["CID", "SOURCE", "STATUS", "TIME LEFT", "CACHED"];
    if sizes.is_some() {
        header.push("SIZE");
    }
    header.push("REQUESTED BY");
    header.push("LAST ERROR");

    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            let mut row = vec![
                r.cid.to_string(),
                r.source.to_string(),
                r.status.to_string(),
                format_time_left(r, now),
                if r.downloaded { "yes" } else { "no" }.to_string(),
            ];
            if let Some(sizes) = sizes {
                row.push(sizes.get(&r.cid).map(|b| format_size(*b)).unwrap_or_else(|| "?".into()));
            }
            row.push(r.requested_by.clone().unwrap_or_else(|| "-".into()));
            row.push(r.last_error.clone().unwrap_or_default());
            row
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_row(&mut out, header.iter().map(|h| h.to_string()), &widths);
    for row in rows {
        push_row(&mut out, row.into_iter(), &widths);
    }
    out
}

fn push_row(out: &mut String, cells: impl Iterator<Item = String>, widths: &[usize]) {
    let line: Vec<String> = cells
        .zip(widths)
        .map(|(cell, w)| format!("{cell:<w$}"))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

/// Remote pins with no live record in the store.
pub fn render_untracked(cids: &[Cid]) -> String {
    if cids.is_empty() {
        return String::new();
    }
    let mut out = format!("\nPinned on the node but not tracked ({}):\n", cids.len());
    for cid in cids {
        out.push_str("  ");
        out.push_str(cid.as_str());
        out.push('\n');
    }
    out
}
