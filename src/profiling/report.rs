//! Profile export (CSV / JSON) and terminal summaries.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use super::{NeuralProfiler, OpStats, ProfileEntry};
use crate::types::OpKind;

/// One exported row per signature.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub hash: String,
    pub op: OpKind,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub calls: u64,
    pub total_cycles: u64,
    pub min_cycles: u64,
    pub max_cycles: u64,
    pub avg_cycles: f64,
    pub cycles_per_element: f64,
    pub jit_candidate: bool,
    pub jit_compiled: bool,
    pub speedup: Option<f64>,
}

impl From<&ProfileEntry> for ExportRow {
    fn from(e: &ProfileEntry) -> Self {
        Self {
            hash: format!("0x{:016x}", e.hash),
            op: e.signature.op,
            m: e.signature.m,
            n: e.signature.n,
            k: e.signature.k,
            calls: e.call_count,
            total_cycles: e.total_cycles,
            min_cycles: e.min_cycles,
            max_cycles: e.max_cycles,
            avg_cycles: e.avg_cycles(),
            cycles_per_element: e.cycles_per_element(),
            jit_candidate: e.jit_candidate,
            jit_compiled: e.jit_compiled,
            speedup: e.speedup(),
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    total_cycles: u64,
    op_stats: Vec<(OpKind, OpStats)>,
    entries: &'a [ExportRow],
}

fn jit_label(e: &ProfileEntry) -> &'static str {
    if e.jit_compiled {
        "YES"
    } else if e.jit_candidate {
        "CAND"
    } else {
        "NO"
    }
}

fn shape_label(e: &ProfileEntry) -> String {
    let s = &e.signature;
    if s.op.is_activation() {
        format!("[{}]", s.m)
    } else {
        format!("{}x{}x{}", s.m, s.n, s.k)
    }
}

impl NeuralProfiler {
    /// Rows for every signature with at least one call, hottest first.
    pub fn export_rows(&self) -> Vec<ExportRow> {
        let mut entries: Vec<&ProfileEntry> = self.entries().filter(|e| e.call_count > 0).collect();
        entries.sort_by(|a, b| b.total_cycles.cmp(&a.total_cycles));
        entries.into_iter().map(ExportRow::from).collect()
    }

    pub fn to_csv(&self) -> String {
        let rows = self.export_rows();
        let mut s = String::with_capacity(128 + rows.len() * 96);
        s.push_str("# Neural profiler data export\n");
        let _ = writeln!(s, "# Total cycles: {}", self.total_cycles());
        s.push_str(
            "# Format: OpHash,OpType,M,N,K,Calls,TotalCycles,MinCycles,MaxCycles,AvgCycles,CyclesPerElem,JIT,Speedup\n",
        );
        for r in &rows {
            let _ = writeln!(
                s,
                "{},{},{},{},{},{},{},{},{},{:.0},{:.4},{},{:.2}",
                r.hash,
                r.op,
                r.m,
                r.n,
                r.k,
                r.calls,
                r.total_cycles,
                r.min_cycles,
                r.max_cycles,
                r.avg_cycles,
                r.cycles_per_element,
                u8::from(r.jit_compiled),
                r.speedup.unwrap_or(0.0),
            );
        }
        s
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let rows = self.export_rows();
        let report = JsonReport {
            total_cycles: self.total_cycles(),
            op_stats: OpKind::ALL.iter().map(|&op| (op, self.op_stats(op))).collect(),
            entries: &rows,
        };
        serde_json::to_string_pretty(&report)
    }

    /// Write the profile to `path`: JSON when it ends in `.json`, CSV otherwise.
    pub fn export(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let body = if is_json { self.to_json().map_err(std::io::Error::other)? } else { self.to_csv() };
        std::fs::write(path, body)?;
        log::info!("profiler: exported {} signatures to {}", self.len(), path.display());
        Ok(())
    }

    /// Per-op totals table.
    pub fn summary_string(&self) -> String {
        let mut s = String::with_capacity(1024);
        let _ = writeln!(s, "\n{:=<72}", "");
        let _ = writeln!(
            s,
            " neural-jit profile  |  {} signatures  |  {} cycles",
            self.len(),
            self.total_cycles()
        );
        let _ = writeln!(s, "{:=<72}", "");
        let _ = writeln!(
            s,
            " {:<10} {:>12} {:>16} {:>8} {:>11} {:>8}",
            "Op", "Calls", "Cycles", "Share", "Candidates", "JIT"
        );
        let _ = writeln!(s, "{:-<72}", "");
        let total = self.total_cycles().max(1) as f64;
        for op in OpKind::ALL {
            let st = self.op_stats(op);
            if st.calls == 0 {
                continue;
            }
            let _ = writeln!(
                s,
                " {:<10} {:>12} {:>16} {:>7.2}% {:>11} {:>8}",
                op.name(),
                st.calls,
                st.cycles,
                st.cycles as f64 * 100.0 / total,
                st.candidates,
                st.compiled
            );
        }
        let _ = writeln!(s, "{:=<72}", "");
        s
    }

    pub fn print_summary(&self) {
        eprintln!("{}", self.summary_string());
    }

    /// The first `top_n` entries of the hotspot list from the last
    /// [`analyze_hotspots`](NeuralProfiler::analyze_hotspots).
    pub fn hotspots_string(&self, top_n: usize) -> String {
        let hot = self.hotspots();
        let shown = &hot[..top_n.min(hot.len())];
        let mut s = String::with_capacity(256 + shown.len() * 96);
        let _ = writeln!(s, "\nTop {} hotspots", shown.len());
        let _ = writeln!(
            s,
            "{:>3} {:<8} {:>14} {:>10} {:>14} {:>12} {:>10} {:>5} {:>8}",
            "#", "Op", "Shape", "Calls", "TotalCycles", "AvgCycles", "Cyc/Elem", "JIT", "Speedup"
        );
        for (i, e) in shown.iter().enumerate() {
            let speedup = e.speedup().map_or_else(|| "-".to_string(), |x| format!("{x:.2}x"));
            let _ = writeln!(
                s,
                "{:>3} {:<8} {:>14} {:>10} {:>14} {:>12.0} {:>10.3} {:>5} {:>8}",
                i + 1,
                e.signature.op.name(),
                shape_label(e),
                e.call_count,
                e.total_cycles,
                e.avg_cycles(),
                e.cycles_per_element(),
                jit_label(e),
                speedup
            );
        }
        let hot_cycles: u64 = shown.iter().map(|e| e.total_cycles).sum();
        if self.total_cycles() > 0 {
            let _ = writeln!(
                s,
                "\nTop {} hotspots account for {:.2}% of profiled cycles",
                shown.len(),
                hot_cycles as f64 * 100.0 / self.total_cycles() as f64
            );
        }
        s
    }

    pub fn print_hotspots(&self, top_n: usize) {
        eprintln!("{}", self.hotspots_string(top_n));
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ProfilerConfig;
    use crate::profiling::NeuralProfiler;
    use crate::types::{KernelSignature, OpKind};

    fn sample() -> NeuralProfiler {
        let mut p = NeuralProfiler::new(ProfilerConfig {
            threshold_calls: 2,
            threshold_cycles: 0,
            bucket_count: 64,
            ..Default::default()
        });
        for _ in 0..3 {
            p.record(&KernelSignature::gemm(8, 16, 4), 1000);
        }
        p.record(&KernelSignature::activation(OpKind::Sigmoid, 7), 40);
        p
    }

    #[test]
    fn test_csv_layout() {
        let csv = sample().to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert!(lines[2].starts_with("# Format: OpHash,OpType,M,N,K,Calls"));
        assert_eq!(lines.len(), 5);
        let row: Vec<&str> = lines[3].split(',').collect();
        assert_eq!(row.len(), 13);
        assert!(row[0].starts_with("0x"));
        assert_eq!(&row[1..7], ["GEMM", "8", "16", "4", "3", "3000"]);
        assert_eq!(row[11], "0");
        assert!(lines[4].contains(",SIGMOID,7,0,0,1,40,"));
    }

    #[test]
    fn test_json_parses_back() {
        let json = sample().to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["total_cycles"], 3040);
        assert_eq!(v["entries"].as_array().unwrap().len(), 2);
        assert_eq!(v["entries"][0]["op"], "Gemm");
        assert_eq!(v["entries"][0]["jit_candidate"], true);
        assert!(v["entries"][1]["speedup"].is_null());
    }

    #[test]
    fn test_export_picks_format_by_extension() {
        let p = sample();
        let dir = std::env::temp_dir();
        let csv = dir.join(format!("neural-jit-report-{}.csv", std::process::id()));
        let json = dir.join(format!("neural-jit-report-{}.json", std::process::id()));
        p.export(&csv).unwrap();
        p.export(&json).unwrap();
        assert!(std::fs::read_to_string(&csv).unwrap().starts_with('#'));
        assert!(std::fs::read_to_string(&json).unwrap().starts_with('{'));
        let _ = std::fs::remove_file(csv);
        let _ = std::fs::remove_file(json);
    }

    #[test]
    fn test_text_reports() {
        let mut p = sample();
        let summary = p.summary_string();
        assert!(summary.contains("GEMM"));
        assert!(summary.contains("SIGMOID"));
        assert!(!summary.contains("TANH"));

        p.analyze_hotspots();
        let hot = p.hotspots_string(1);
        assert!(hot.contains("Top 1 hotspots"));
        assert!(hot.contains("8x16x4"));
        assert!(hot.contains("CAND"));
        assert!(!hot.contains("[7]"));
    }
}
