//! Human-readable rendering of command results. JSON output goes through
//! `serde_json` on the same report types.

use std::fmt;

use cutover_core::{Release, ReleaseId, unix_now};
use cutover_state::PruneReport;
use serde::Serialize;

use crate::orchestrator::{DeployReport, RollbackReport, StatusReport};

/// Pretty JSON for any report.
pub fn to_json<T: Serialize>(report: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

fn id_or_none(id: Option<ReleaseId>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string())
}

fn ago(ts: Option<u64>) -> String {
    let Some(ts) = ts else {
        return "-".to_string();
    };
    let secs = unix_now().saturating_sub(ts);
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

fn detail(release: &Release) -> String {
    if let Some(failure) = &release.failure {
        return failure.clone();
    }
    match &release.checksum {
        Some(sum) => format!("sha256:{}  {}", &sum[..sum.len().min(12)], release.artifact),
        None => release.artifact.clone(),
    }
}

impl fmt::Display for DeployReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: release {} is active (previous: {}, {} probes)",
            self.environment,
            self.release,
            id_or_none(self.previous),
            self.probes
        )?;
        if let Some(sum) = &self.checksum {
            writeln!(f, "artifact sha256 {sum}")?;
        }
        if !self.pruned.removed.is_empty() || !self.pruned.errors.is_empty() {
            write!(f, "{}", PruneSummary(&self.pruned))?;
        }
        Ok(())
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: rolled back from {} to release {}",
            self.environment,
            id_or_none(self.from),
            self.to
        )
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "environment  {}", self.environment)?;
        writeln!(f, "root         {}", self.root.display())?;
        writeln!(f, "current      {}", id_or_none(self.current))?;
        if self.consistent {
            writeln!(f, "link         {}", id_or_none(self.link))?;
        } else {
            writeln!(
                f,
                "link         {}  (MISMATCH: store says {})",
                id_or_none(self.link),
                id_or_none(self.current)
            )?;
        }
        writeln!(
            f,
            "lock         {}",
            self.lock_holder.as_deref().unwrap_or("free")
        )?;
        writeln!(
            f,
            "maintenance  {}",
            if self.maintenance { "on" } else { "off" }
        )?;

        if self.releases.is_empty() {
            return writeln!(f, "\nno releases");
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>6}  {:<9} {:<9} {:<10} {:<11} DETAIL",
            "ID", "STATUS", "CREATED", "ACTIVATED", "STEP"
        )?;
        for release in self.releases.iter().rev() {
            writeln!(
                f,
                "{:>6}  {:<9} {:<9} {:<10} {:<11} {}",
                release.id.0,
                release.status.to_string(),
                ago(Some(release.created_at)),
                ago(release.activated_at),
                release
                    .failed_step
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                detail(release)
            )?;
        }
        Ok(())
    }
}

/// Text form of a prune pass.
pub struct PruneSummary<'a>(pub &'a PruneReport);

impl fmt::Display for PruneSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        if report.removed.is_empty() {
            writeln!(f, "nothing to prune")?;
        } else {
            let ids: Vec<String> = report.removed.iter().map(|id| id.to_string()).collect();
            writeln!(f, "pruned releases {}", ids.join(", "))?;
        }
        for (id, reason) in &report.errors {
            writeln!(f, "could not remove release {id}: {reason}")?;
        }
        Ok(())
    }
}
