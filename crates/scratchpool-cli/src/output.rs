//! Result rendering: plain tables on stdout, JSON on request

use clap::ArgMatches;
use scratchpool_core::{
    AllocatedHandle, EnvironmentLimits, ResourceInfo, SandboxProcess, UserUsage,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Where and how results go
#[derive(Debug, Clone, Default)]
pub(crate) struct Emit {
    json: bool,
    outputfile: Option<PathBuf>,
}

impl Emit {
    pub(crate) fn from_args(args: &ArgMatches) -> Self {
        Self {
            json: args.get_flag("json"),
            outputfile: args.get_one::<PathBuf>("outputfile").cloned(),
        }
    }

    /// Print `value` as JSON or via `render`, and write it to the output file if set
    pub(crate) fn write<T, F>(&self, value: &T, render: F) -> anyhow::Result<()>
    where
        T: Serialize,
        F: FnOnce() -> String,
    {
        let pretty = serde_json::to_string_pretty(value)?;
        if let Some(path) = &self.outputfile {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &pretty)?;
        }
        if self.json {
            println!("{pretty}");
        } else {
            print!("{}", render());
        }
        Ok(())
    }
}

/// Summary of a pool record without its credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ListRow {
    pub(crate) id: String,
    pub(crate) org_id: Option<String>,
    pub(crate) username: Option<String>,
    pub(crate) allocation: String,
    pub(crate) expires: Option<String>,
    pub(crate) owner: Option<String>,
}

pub(crate) fn list_rows(infos: &[ResourceInfo]) -> Vec<ListRow> {
    infos
        .iter()
        .map(|info| ListRow {
            id: info.id.to_string(),
            org_id: info.remote_resource_id.as_ref().map(|id| id.short().to_string()),
            username: info.signup_username.clone(),
            allocation: info.allocation_status.as_str().to_string(),
            expires: info.expiration_date.map(|d| d.to_string()),
            owner: info.owner_username.clone(),
        })
        .collect()
}

fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let line = |out: &mut String, cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<w$}"))
            .collect();
        let _ = writeln!(out, "{}", padded.join("  ").trim_end());
    };

    let header: Vec<String> = headers.iter().map(|h| (*h).to_string()).collect();
    line(&mut out, &header);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    line(&mut out, &rule);
    for row in rows {
        line(&mut out, row);
    }
    out
}

fn opt(value: Option<&str>) -> String {
    value.unwrap_or("").to_string()
}

pub(crate) fn handles_table(handles: &[AllocatedHandle]) -> String {
    let rows: Vec<Vec<String>> = handles
        .iter()
        .map(|h| {
            vec![
                h.username.clone(),
                h.password.clone(),
                h.login_url.clone(),
                h.org_id.clone(),
                opt(h.alias.as_deref()),
                h.expiration_date.map(|d| d.to_string()).unwrap_or_default(),
            ]
        })
        .collect();
    table(
        &["USERNAME", "PASSWORD", "LOGIN URL", "ORG ID", "ALIAS", "EXPIRES"],
        &rows,
    )
}

pub(crate) fn list_table(rows: &[ListRow]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.id.clone(),
                opt(r.org_id.as_deref()),
                opt(r.username.as_deref()),
                r.allocation.clone(),
                opt(r.expires.as_deref()),
                opt(r.owner.as_deref()),
            ]
        })
        .collect();
    table(
        &["ID", "ORG ID", "USERNAME", "ALLOCATION", "EXPIRES", "OWNER"],
        &rows,
    )
}

pub(crate) fn sandbox_table(processes: &[SandboxProcess]) -> String {
    let rows: Vec<Vec<String>> = processes
        .iter()
        .map(|p| {
            vec![
                p.id.clone(),
                p.sandbox_name.clone(),
                opt(p.status.as_deref()),
                p.copy_progress.map(|c| format!("{c}%")).unwrap_or_default(),
                opt(p.last_modified.as_deref()),
            ]
        })
        .collect();
    table(
        &["ID", "SANDBOX", "STATUS", "PROGRESS", "LAST MODIFIED"],
        &rows,
    )
}

pub(crate) fn limits_table(limits: &EnvironmentLimits, usage: &[UserUsage]) -> String {
    let counters = [
        ("ActiveScratchOrgs", limits.active),
        ("DailyScratchOrgs", limits.daily),
    ];
    let rows: Vec<Vec<String>> = counters
        .iter()
        .map(|(name, c)| {
            vec![
                (*name).to_string(),
                c.max.to_string(),
                c.remaining.to_string(),
                c.in_use().to_string(),
            ]
        })
        .collect();
    let mut out = table(&["LIMIT", "MAX", "REMAINING", "IN USE"], &rows);

    if !usage.is_empty() {
        out.push('\n');
        let rows: Vec<Vec<String>> = usage
            .iter()
            .map(|u| vec![u.email.clone(), u.count.to_string()])
            .collect();
        out.push_str(&table(&["EMAIL", "ACTIVE"], &rows));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scratchpool_core::{LimitCounter, RecordId};

    #[test]
    fn table_pads_columns() {
        let out = table(
            &["A", "LONGER"],
            &[vec!["wide value".into(), "x".into()]],
        );
        assert_eq!(out, "A           LONGER\n----------  ------\nwide value  x\n");
    }

    #[test]
    fn handles_table_lists_connection_details() {
        let handle = AllocatedHandle {
            username: "test-abc@example.com".into(),
            password: "pw".into(),
            login_url: "https://abc.scratch.example.com".into(),
            org_id: "00D000000000001".into(),
            alias: Some("SO-ABCDEF".into()),
            record_id: RecordId::parse("2SR000000000001").unwrap(),
            expiration_date: None,
        };
        let out = handles_table(&[handle]);
        assert!(out.starts_with("USERNAME"));
        assert!(out.contains("SO-ABCDEF"));
        assert!(out.contains("00D000000000001"));
    }

    #[test]
    fn limits_table_includes_usage() {
        let limits = EnvironmentLimits {
            active: LimitCounter { max: 10, remaining: 4 },
            daily: LimitCounter { max: 20, remaining: 20 },
        };
        let usage = vec![UserUsage { email: "dev@example.com".into(), count: 6 }];
        let out = limits_table(&limits, &usage);
        assert!(out.contains("ActiveScratchOrgs  10   4          6"));
        assert!(out.contains("dev@example.com  6"));
    }

    #[test]
    fn output_file_receives_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/result.json");
        let emit = Emit {
            json: true,
            outputfile: Some(path.clone()),
        };
        emit.write(&serde_json::json!({"ok": true}), String::new).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written, serde_json::json!({"ok": true}));
    }
}
