//! Terminal report formatting
//!
//! One aligned line per tensor plus a model-level rollup. Lines are
//! emitted in worker-completion order, so nothing here depends on file or
//! lexical order; alignment widths are computed per batch.

use crate::analyze::{AnalyzedModel, AnalyzedTensor};

/// Format a byte count in binary units.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn human_bytes(i: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    if i > GIB {
        format!("{:.1}GiB", i as f64 / GIB as f64)
    } else if i > MIB {
        format!("{:.1}MiB", i as f64 / MIB as f64)
    } else if i > KIB {
        format!("{:.1}kiB", i as f64 / KIB as f64)
    } else {
        format!("{i}B")
    }
}

/// Column widths (name, element count) aligning one batch of tensors.
#[must_use]
pub fn column_widths(tensors: &[AnalyzedTensor]) -> (usize, usize) {
    let mut name_width = 0;
    let mut size_width = 0;
    for t in tensors {
        name_width = name_width.max(t.name.len());
        size_width = size_width.max(t.numel.to_string().len());
    }
    (name_width, size_width)
}

/// Format one per-tensor report line.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn tensor_line(a: &AnalyzedTensor, name_width: usize, size_width: usize) -> String {
    let bits = 8 * a.dtype.word_size() as u64;
    let wasted = u64::from(a.wasted_bits());
    let ratio = 100.0 / bits as f64;
    let mut line = if a.exponent.allocation() != 0 {
        format!(
            "{:<name_width$}: {:>size_width$}w  avg={:4.1} [{:6.1}, {:6.1}]  sign={:1.0}bit  exponent={:3.1}/{}bits  mantissa={:4.1}/{}bits  wasted={:2}/{}bits {:4.1}%  {:>8}",
            a.name,
            a.numel,
            a.avg,
            a.min,
            a.max,
            a.sign.bits_actually_used(),
            a.exponent.bits_actually_used(),
            a.exponent.allocation(),
            a.mantissa.bits_actually_used(),
            a.mantissa.allocation(),
            wasted,
            bits,
            ratio * wasted as f64,
            human_bytes(a.wasted_bytes()),
        )
    } else {
        format!(
            "{:<name_width$}: {:>size_width$}w  avg={:11.0} [{:11.0}, {:10.0}]  sign={:1.0}bit  mantissa={:4.1}/{}bits  wasted={:2}/{}bits {:4.1}%  {:>8}",
            a.name,
            a.numel,
            a.avg,
            a.min,
            a.max,
            a.sign.bits_actually_used(),
            a.mantissa.bits_actually_used(),
            a.mantissa.allocation(),
            wasted,
            bits,
            ratio * wasted as f64,
            human_bytes(a.wasted_bytes()),
        )
    };
    if a.nan != 0 || a.inf != 0 {
        line.push_str(&format!("  nan={}  inf={}", a.nan, a.inf));
    }
    line
}

/// Format the model-level rollup line.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn model_summary(model: &AnalyzedModel) -> String {
    let wasted = model.total_wasted_bytes();
    let total = model.total_bytes();
    let pct = if total == 0 {
        0.0
    } else {
        100.0 * wasted as f64 / total as f64
    };
    format!(
        "{} ({pct:.1}%) wasted on {} total storing {} weights",
        human_bytes(wasted),
        human_bytes(total),
        model.total_weights(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze_tensor;
    use crate::safetensors::Dtype;

    fn le16(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0B");
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.0kiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0MiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.0GiB");
    }

    #[test]
    fn test_column_widths() {
        let tensors = vec![
            analyze_tensor("short", Dtype::BF16, &le16(&[0x3F80])).expect("analyze"),
            analyze_tensor("a.much.longer.name", Dtype::BF16, &vec![0u8; 2048]).expect("analyze"),
        ];
        let (name_width, size_width) = column_widths(&tensors);
        assert_eq!(name_width, "a.much.longer.name".len());
        assert_eq!(size_width, "1024".len());
    }

    #[test]
    fn test_tensor_line_float() {
        let a = analyze_tensor("w", Dtype::BF16, &le16(&[0x3F80, 0xBF80])).expect("analyze");
        let line = tensor_line(&a, 4, 4);
        assert!(line.starts_with("w   : "));
        assert!(line.contains("exponent="));
        assert!(line.contains("/16bits"));
        assert!(!line.contains("nan="));
    }

    #[test]
    fn test_tensor_line_integer() {
        let data: Vec<u8> = [1u32, 2, 4, 8].iter().flat_map(|w| w.to_le_bytes()).collect();
        let a = analyze_tensor("idx", Dtype::I32, &data).expect("analyze");
        let line = tensor_line(&a, 3, 1);
        assert!(!line.contains("exponent="));
        assert!(line.contains("mantissa= 4.0/31bits"));
        assert!(line.contains("/32bits"));
    }

    #[test]
    fn test_tensor_line_flags_nan() {
        let a = analyze_tensor("n", Dtype::F16, &le16(&[0x7E00])).expect("analyze");
        let line = tensor_line(&a, 1, 1);
        assert!(line.contains("nan=1"));
        assert!(line.contains("inf=0"));
    }

    #[test]
    fn test_model_summary() {
        let model = AnalyzedModel {
            tensors: vec![analyze_tensor("a", Dtype::BF16, &vec![0u8; 2048]).expect("analyze")],
        };
        let line = model_summary(&model);
        assert!(line.contains("wasted on"));
        assert!(line.contains("storing 1024 weights"));
        assert_eq!(model_summary(&AnalyzedModel::default()), "0B (0.0%) wasted on 0B total storing 0 weights");
    }
}
