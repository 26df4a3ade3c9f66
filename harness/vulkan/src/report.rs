//! Derived metrics and the final benchmark summary.

use std::fmt;

use serde::Serialize;

use crate::config::SystemSize;
use crate::error::{BenchError, Result};

const GIB: f64 = (1u64 << 30) as f64;

/// Average per-dispatch latencies of the three variants plus the system
/// they were measured on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub device_name: String,
    pub no_bank_conflict_ms: f64,
    pub bank_conflict_ms: f64,
    pub transfer_ms: f64,
    pub coalesced_memory: u32,
    pub system_size: SystemSize,
    pub buffer_bytes: u64,
    pub batch: u32,
}

impl Report {
    /// Effective bandwidth of the pure-transfer kernel. Each dispatch reads
    /// and writes the whole buffer once.
    pub fn bandwidth_gbs(&self) -> f64 {
        2.0 * self.buffer_bytes as f64 / GIB / (self.transfer_ms / 1000.0)
    }

    /// Transfer latency as a percentage of the no-bank-conflict transpose.
    pub fn transfer_ratio_pct(&self) -> f64 {
        100.0 * self.transfer_ms / self.no_bank_conflict_ms
    }

    pub fn buffer_kib(&self) -> u64 {
        self.buffer_bytes / 1024
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Json<'r> {
            #[serde(flatten)]
            report: &'r Report,
            buffer_kib: u64,
            bandwidth_gbs: f64,
            transfer_ratio_pct: f64,
        }
        serde_json::to_string_pretty(&Json {
            report: self,
            buffer_kib: self.buffer_kib(),
            bandwidth_gbs: self.bandwidth_gbs(),
            transfer_ratio_pct: self.transfer_ratio_pct(),
        })
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device: {}", self.device_name)?;
        writeln!(
            f,
            "Transpose time with no bank conflicts: {:.3} ms",
            self.no_bank_conflict_ms
        )?;
        writeln!(
            f,
            "Transpose time with bank conflicts:    {:.3} ms",
            self.bank_conflict_ms
        )?;
        writeln!(f, "Transfer time:                         {:.3} ms", self.transfer_ms)?;
        writeln!(f, "Coalesced memory: {} bytes", self.coalesced_memory)?;
        writeln!(
            f,
            "System size: {}x{}",
            self.system_size.width, self.system_size.height
        )?;
        writeln!(f, "Buffer size: {} KB", self.buffer_kib())?;
        writeln!(f, "Bandwidth: {:.2} GB/s", self.bandwidth_gbs())?;
        write!(
            f,
            "Transfer time/transpose time: {:.3}%",
            self.transfer_ratio_pct()
        )
    }
}

/// Check that `output` is the transpose of `input` for a `size` system,
/// returning the first mismatching element.
pub fn verify_transpose(input: &[f32], output: &[f32], size: SystemSize) -> Result<()> {
    let (w, h) = (size.width as usize, size.height as usize);
    debug_assert!(input.len() >= w * h && output.len() >= w * h);
    for y in 0..h {
        for x in 0..w {
            let index = x * h + y;
            let expected = input[y * w + x];
            let actual = output[index];
            if actual != expected {
                return Err(BenchError::Verification {
                    index,
                    expected,
                    actual,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Report {
        Report {
            device_name: "Test GPU".into(),
            no_bank_conflict_ms: 0.25,
            bank_conflict_ms: 0.5,
            transfer_ms: 0.125,
            coalesced_memory: 32,
            system_size: SystemSize::square(2048),
            buffer_bytes: 16 * 1024 * 1024,
            batch: 1000,
        }
    }

    #[test]
    fn bandwidth() {
        // 32 MiB moved per 0.125 ms
        let report = sample();
        assert!((report.bandwidth_gbs() - 250.0).abs() < 1e-9);
    }

    #[test]
    fn transfer_ratio() {
        assert!((sample().transfer_ratio_pct() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn buffer_kib() {
        assert_eq!(sample().buffer_kib(), 16384);
    }

    #[test]
    fn text_table() {
        let text = sample().to_string();
        assert!(text.contains("Transpose time with no bank conflicts: 0.250 ms"), "{text}");
        assert!(text.contains("Coalesced memory: 32 bytes"));
        assert!(text.contains("System size: 2048x2048"));
        assert!(text.contains("Buffer size: 16384 KB"));
        assert!(text.contains("Bandwidth: 250.00 GB/s"));
        assert!(text.ends_with("50.000%"));
    }

    #[test]
    fn json_includes_derived_fields() {
        let json: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["device_name"], "Test GPU");
        assert_eq!(json["system_size"]["width"], 2048);
        assert_eq!(json["buffer_kib"], 16384);
        assert_eq!(json["transfer_ratio_pct"], 50.0);
    }

    #[test]
    fn verifies_transpose() {
        let size = SystemSize {
            width: 3,
            height: 2,
            depth: 1,
        };
        // input rows: [0 1 2] [3 4 5]
        let input = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let output = [0.0, 3.0, 1.0, 4.0, 2.0, 5.0];
        assert!(verify_transpose(&input, &output, size).is_ok());
    }

    #[test]
    fn reports_first_mismatch() {
        let size = SystemSize::square(2);
        let input = [0.0, 1.0, 2.0, 3.0];
        let output = [0.0, 1.0, 2.0, 3.0];
        match verify_transpose(&input, &output, size) {
            Err(BenchError::Verification {
                index,
                expected,
                actual,
            }) => {
                assert_eq!(index, 2);
                assert_eq!(expected, 1.0);
                assert_eq!(actual, 2.0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
