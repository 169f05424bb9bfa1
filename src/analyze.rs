//! Per-tensor bit-utilization analysis
//!
//! [`analyze_tensor`] walks a tensor's raw little-endian bytes once and
//! histograms the sign, exponent and mantissa fields of every element while
//! tracking min/max/average and NaN / infinite-like tallies. The result is
//! an [`AnalyzedTensor`]; a model's worth of them aggregates into an
//! [`AnalyzedModel`], which also serves as the persisted analysis document.
//!
//! Reinterpreting the byte buffer as a typed slice is the hot path; when
//! the buffer happens to be misaligned for the element type the sweep falls
//! back to per-element loads. Both paths produce identical results.

use once_cell::sync::OnceCell;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{MedirError, Result};
use crate::floatx::{f32_components, BF16, F16, F8E4M3, F8E5M2};
use crate::safetensors::Dtype;
use crate::sets::{BitSet, CountSet};

/// Finite values of larger magnitude are tallied as infinite-like: single
/// precision still represents them, but they clearly signal out-of-range
/// accumulation from the source format.
const INF_LIKE_THRESHOLD: f32 = 1e37;

/// The population of one bit field (sign, exponent or mantissa).
#[derive(Debug, Clone, PartialEq)]
enum Population {
    /// Saturating counters, one per distinct field value or bit position.
    Counts(CountSet),
    /// Presence bits, one per distinct field value.
    Bits(BitSet),
}

impl Population {
    fn record(&mut self, i: usize) {
        match self {
            Self::Counts(c) => c.add(i),
            Self::Bits(b) => b.set(i),
        }
    }

    fn effective(&self) -> u32 {
        match self {
            Self::Counts(c) => c.effective(),
            Self::Bits(b) => b.effective(),
        }
    }

    fn seen(&self, i: usize) -> bool {
        match self {
            Self::Counts(c) => c.get(i) != 0,
            Self::Bits(b) => b.get(i),
        }
    }
}

impl Serialize for Population {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Counts(c) => c.serialize(serializer),
            Self::Bits(b) => b.serialize(serializer),
        }
    }
}

/// Derived figures, computed once on first read.
#[derive(Debug, Clone, PartialEq)]
struct Derived {
    effective: u32,
    used: f32,
    wasted: u32,
}

/// The analysis of one bit field of one tensor.
///
/// Tracks how many bits the format allocates to the field against the
/// population of values the tensor actually exhibits there.
#[derive(Debug, Clone, Serialize)]
pub struct BitKind {
    /// Number of bits the format allocates to this field.
    #[serde(rename = "alloc")]
    allocation: u32,
    /// The observed population.
    #[serde(rename = "seen")]
    seen: Population,
    /// Bit-position mode: the population counts individual bits of integer
    /// values rather than distinct field values.
    #[serde(skip)]
    bitwise: bool,
    #[serde(skip)]
    derived: OnceCell<Derived>,
}

impl PartialEq for BitKind {
    fn eq(&self, other: &Self) -> bool {
        self.allocation == other.allocation
            && self.bitwise == other.bitwise
            && self.seen == other.seen
    }
}

impl BitKind {
    /// A field that does not exist for this dtype (zero allocation).
    fn absent() -> Self {
        Self {
            allocation: 0,
            seen: Population::Counts(CountSet::new(0)),
            bitwise: false,
            derived: OnceCell::new(),
        }
    }

    /// Counter per distinct field value, domain `2^allocation`.
    fn distinct(allocation: u32) -> Self {
        Self {
            allocation,
            seen: Population::Counts(CountSet::new(1 << allocation)),
            bitwise: false,
            derived: OnceCell::new(),
        }
    }

    /// Presence bit per distinct field value, domain `2^allocation`.
    ///
    /// Chosen over counters once the domain makes a byte per cell too
    /// expensive (the F32 mantissa has 2²³ cells).
    fn presence(allocation: u32) -> Self {
        Self {
            allocation,
            seen: Population::Bits(BitSet::new(1 << allocation)),
            bitwise: false,
            derived: OnceCell::new(),
        }
    }

    /// Counter per bit position of an integer value, domain `allocation`.
    fn bitwise(allocation: u32) -> Self {
        Self {
            allocation,
            seen: Population::Counts(CountSet::new(allocation as usize)),
            bitwise: true,
            derived: OnceCell::new(),
        }
    }

    fn record(&mut self, i: usize) {
        self.seen.record(i);
    }

    fn derived(&self) -> &Derived {
        self.derived.get_or_init(|| {
            let effective = self.seen.effective();
            if self.allocation == 0 {
                return Derived {
                    effective,
                    used: 0.0,
                    wasted: 0,
                };
            }
            if self.bitwise {
                // Counters hold bit positions, not distinct values: every
                // populated position is a bit in use.
                #[allow(clippy::cast_precision_loss)]
                let used = effective as f32;
                return Derived {
                    effective,
                    used,
                    wasted: self.allocation.saturating_sub(effective),
                };
            }
            if effective == 0 {
                return Derived {
                    effective,
                    used: 0.0,
                    wasted: self.allocation,
                };
            }
            let used = f64::from(effective).log2();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let wasted = self.allocation.saturating_sub(used.ceil() as u32);
            #[allow(clippy::cast_possible_truncation)]
            let used = used as f32;
            Derived {
                effective,
                used,
                wasted,
            }
        })
    }

    /// Number of bits the format allocates to this field.
    #[must_use]
    pub fn allocation(&self) -> u32 {
        self.allocation
    }

    /// Number of distinct values (or bit positions) observed.
    #[must_use]
    pub fn effective(&self) -> u32 {
        self.derived().effective
    }

    /// `log₂(effective)`: the information-theoretic lower bound on bits
    /// needed to distinguish the observed values. For bit-position
    /// populations this is the number of positions in use.
    #[must_use]
    pub fn bits_actually_used(&self) -> f32 {
        self.derived().used
    }

    /// Allocated bits minus the ceiling of bits actually used.
    #[must_use]
    pub fn bits_wasted(&self) -> u32 {
        self.derived().wasted
    }

    /// Whether cell `i` of the population is non-empty.
    ///
    /// # Panics
    ///
    /// Panics if `i` is outside the field's domain.
    #[must_use]
    pub fn seen(&self, i: usize) -> bool {
        self.seen.seen(i)
    }
}

impl<'de> Deserialize<'de> for BitKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use base64::engine::general_purpose::STANDARD_NO_PAD;
        use base64::Engine;

        #[derive(Deserialize)]
        struct Raw {
            alloc: u32,
            seen: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        if raw.seen.is_empty() {
            return Ok(Self::absent());
        }
        // No supported field allocates more than 32 bits; rejecting here
        // keeps the 2^alloc arithmetic below safe.
        if raw.alloc > 32 {
            return Err(D::Error::custom(format!(
                "allocation {} out of range",
                raw.alloc
            )));
        }
        let payload = STANDARD_NO_PAD
            .decode(&raw.seen)
            .map_err(|e| D::Error::custom(format!("invalid population encoding: {e}")))?;
        // The payload length alone discriminates the variants: a counter
        // per bit position has `alloc` cells, a counter per distinct value
        // has `2^alloc`, and the presence form carries its tail-length byte
        // plus whole words.
        let alloc = raw.alloc as usize;
        let (seen, bitwise) = if payload.len() == alloc {
            (Population::Counts(CountSet::from_bytes(payload)), true)
        } else if payload.len() == 1usize << raw.alloc {
            (Population::Counts(CountSet::from_bytes(payload)), false)
        } else {
            let bits = BitSet::from_payload(&payload)
                .ok_or_else(|| D::Error::custom("invalid population encoding"))?;
            if bits.len() != 1usize << raw.alloc {
                return Err(D::Error::custom(format!(
                    "population of {} cells does not match allocation {}",
                    bits.len(),
                    raw.alloc
                )));
            }
            (Population::Bits(bits), false)
        };
        Ok(Self {
            allocation: raw.alloc,
            seen,
            bitwise,
            derived: OnceCell::new(),
        })
    }
}

/// Per-tensor analysis record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedTensor {
    /// Tensor name
    pub name: String,
    /// Element type
    pub dtype: Dtype,
    /// Number of weights
    pub numel: u64,
    /// Arithmetic mean over finite elements (0 when none are finite)
    pub avg: f64,
    /// Smallest finite element, `+MAXF` sentinel when none are finite
    pub min: f64,
    /// Largest finite element, `-MAXF` sentinel when none are finite
    pub max: f64,
    /// Count of infinite or infinite-like elements
    pub inf: u64,
    /// Count of NaN elements
    pub nan: u64,
    /// Sign field analysis
    #[serde(rename = "s")]
    pub sign: BitKind,
    /// Exponent field analysis
    #[serde(rename = "exp")]
    pub exponent: BitKind,
    /// Mantissa field analysis
    #[serde(rename = "man")]
    pub mantissa: BitKind,
}

impl AnalyzedTensor {
    /// Number of bytes this tensor occupies on disk.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.numel * self.dtype.word_size() as u64
    }

    /// Whether the tensor has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.numel == 0
    }

    /// Total bits wasted per element across the three fields.
    #[must_use]
    pub fn wasted_bits(&self) -> u32 {
        self.sign.bits_wasted() + self.exponent.bits_wasted() + self.mantissa.bits_wasted()
    }

    /// Bytes recoverable by a format sized to the observed populations.
    #[must_use]
    pub fn wasted_bytes(&self) -> u64 {
        self.numel * u64::from(self.wasted_bits()) / 8
    }

    /// For BF16 tensors, whether every element fits the F16 exponent
    /// range. `None` for other dtypes.
    #[must_use]
    pub fn is_f16_compatible(&self) -> Option<bool> {
        if self.dtype != Dtype::BF16 {
            return None;
        }
        // BF16 exponents 1..=9 fall below the smallest F16 exponent.
        Some((1..10).all(|i| !self.exponent.seen(i)))
    }
}

/// Whole-model analysis: the persisted analysis document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedModel {
    /// Per-tensor records, in completion order.
    pub tensors: Vec<AnalyzedTensor>,
}

impl AnalyzedModel {
    /// Total number of weights.
    #[must_use]
    pub fn total_weights(&self) -> u64 {
        self.tensors.iter().map(|t| t.numel).sum()
    }

    /// Total bytes occupied on disk.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.tensors.iter().map(AnalyzedTensor::len).sum()
    }

    /// Total bytes recoverable across all tensors.
    #[must_use]
    pub fn total_wasted_bytes(&self) -> u64 {
        self.tensors.iter().map(AnalyzedTensor::wasted_bytes).sum()
    }
}

/// Running float statistics over one sweep.
struct FloatStats {
    min: f32,
    max: f32,
    sum: f64,
    finite: u64,
    nan: u64,
    inf: u64,
}

impl FloatStats {
    fn new() -> Self {
        Self {
            min: f32::MAX,
            max: f32::MIN,
            sum: 0.0,
            finite: 0,
            nan: 0,
            inf: 0,
        }
    }

    #[inline]
    fn update(&mut self, v: f32) {
        if v.is_nan() {
            self.nan += 1;
        } else if v.is_infinite() || v.abs() > INF_LIKE_THRESHOLD {
            self.inf += 1;
        } else {
            self.sum += f64::from(v);
            if v < self.min {
                self.min = v;
            }
            if v > self.max {
                self.max = v;
            }
            self.finite += 1;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn avg(&self) -> f64 {
        if self.finite == 0 {
            0.0
        } else {
            self.sum / self.finite as f64
        }
    }
}

/// The three field populations of one tensor under analysis.
struct FieldSets {
    sign: BitKind,
    exponent: BitKind,
    mantissa: BitKind,
}

impl FieldSets {
    fn for_dtype(dtype: Dtype, sign_bits: u32, exponent_bits: u32, mantissa_bits: u32) -> Self {
        let integer = matches!(dtype, Dtype::I32 | Dtype::U32);
        Self {
            sign: if sign_bits == 0 {
                BitKind::absent()
            } else {
                BitKind::distinct(sign_bits)
            },
            exponent: if exponent_bits == 0 {
                BitKind::absent()
            } else {
                BitKind::distinct(exponent_bits)
            },
            mantissa: if integer {
                BitKind::bitwise(mantissa_bits)
            } else if mantissa_bits <= 7 {
                BitKind::distinct(mantissa_bits)
            } else {
                BitKind::presence(mantissa_bits)
            },
        }
    }
}

/// Analyze how well used the bits in a tensor are.
///
/// Walks `data`, the tensor's raw little-endian bytes, exactly once.
/// NaN and infinite elements are data, not failures: they are counted and
/// excluded from min/max/average.
///
/// # Errors
///
/// - [`MedirError::UnsupportedDtype`] when `dtype` is outside the
///   supported closed set.
/// - [`MedirError::MalformedTensor`] when the byte length is not a
///   multiple of the element size.
pub fn analyze_tensor(name: &str, dtype: Dtype, data: &[u8]) -> Result<AnalyzedTensor> {
    let Some((sign_bits, exponent_bits, mantissa_bits)) = dtype.bit_widths() else {
        return Err(MedirError::UnsupportedDtype {
            name: name.to_string(),
            dtype: dtype.to_string(),
        });
    };
    let word = dtype.word_size();
    if data.len() % word != 0 {
        return Err(MedirError::MalformedTensor {
            name: name.to_string(),
            reason: format!(
                "byte length {} is not a multiple of element size {word}",
                data.len()
            ),
        });
    }
    let numel = (data.len() / word) as u64;
    let mut sets = FieldSets::for_dtype(dtype, sign_bits, exponent_bits, mantissa_bits);

    let (avg, min, max, nan, inf) = match dtype {
        Dtype::BF16 => {
            let mut stats = FloatStats::new();
            sweep16(
                data,
                |w| {
                    let (s, e, m) = BF16::from_bits(w).components();
                    (s, e, u16::from(m))
                },
                |w| BF16::from_bits(w).lookup(),
                &mut sets,
                &mut stats,
            );
            float_summary(&stats)
        }
        Dtype::F16 => {
            let mut stats = FloatStats::new();
            sweep16(
                data,
                |w| F16::from_bits(w).components(),
                |w| F16::from_bits(w).lookup(),
                &mut sets,
                &mut stats,
            );
            float_summary(&stats)
        }
        Dtype::F8E4M3 => {
            let mut stats = FloatStats::new();
            sweep8(
                data,
                |w| F8E4M3::from_bits(w).components(),
                |w| F8E4M3::from_bits(w).to_f32(),
                &mut sets,
                &mut stats,
            );
            float_summary(&stats)
        }
        Dtype::F8E5M2 => {
            let mut stats = FloatStats::new();
            sweep8(
                data,
                |w| F8E5M2::from_bits(w).components(),
                |w| F8E5M2::from_bits(w).to_f32(),
                &mut sets,
                &mut stats,
            );
            float_summary(&stats)
        }
        Dtype::F32 => {
            let mut stats = FloatStats::new();
            sweep_f32(data, &mut sets, &mut stats);
            float_summary(&stats)
        }
        Dtype::I32 => sweep_i32(data, &mut sets),
        Dtype::U32 => sweep_u32(data, &mut sets),
        _ => unreachable!("bit_widths() returned Some for an unsupported dtype"),
    };

    Ok(AnalyzedTensor {
        name: name.to_string(),
        dtype,
        numel,
        avg,
        min,
        max,
        inf,
        nan,
        sign: sets.sign,
        exponent: sets.exponent,
        mantissa: sets.mantissa,
    })
}

fn float_summary(stats: &FloatStats) -> (f64, f64, f64, u64, u64) {
    (
        stats.avg(),
        f64::from(stats.min),
        f64::from(stats.max),
        stats.nan,
        stats.inf,
    )
}

/// Walk 16-bit words. Remapping the buffer to a `&[u16]` slice is a
/// measurable win over per-element loads; misaligned buffers take the
/// scalar path instead.
fn sweep16<C, V>(data: &[u8], components: C, convert: V, sets: &mut FieldSets, stats: &mut FloatStats)
where
    C: Fn(u16) -> (u8, u8, u16),
    V: Fn(u16) -> f32,
{
    let mut visit = |w: u16| {
        let (s, e, m) = components(w);
        sets.sign.record(usize::from(s));
        sets.exponent.record(usize::from(e));
        sets.mantissa.record(usize::from(m));
        stats.update(convert(w));
    };
    if cfg!(target_endian = "little") {
        if let Ok(words) = bytemuck::try_cast_slice::<u8, u16>(data) {
            for &w in words {
                visit(w);
            }
            return;
        }
    }
    for c in data.chunks_exact(2) {
        visit(u16::from_le_bytes([c[0], c[1]]));
    }
}

fn sweep8<C, V>(data: &[u8], components: C, convert: V, sets: &mut FieldSets, stats: &mut FloatStats)
where
    C: Fn(u8) -> (u8, u8, u8),
    V: Fn(u8) -> f32,
{
    for &w in data {
        let (s, e, m) = components(w);
        sets.sign.record(usize::from(s));
        sets.exponent.record(usize::from(e));
        sets.mantissa.record(usize::from(m));
        stats.update(convert(w));
    }
}

fn sweep_f32(data: &[u8], sets: &mut FieldSets, stats: &mut FloatStats) {
    let mut visit = |bits: u32| {
        let (s, e, m) = f32_components(bits);
        sets.sign.record(usize::from(s));
        sets.exponent.record(usize::from(e));
        sets.mantissa.record(m as usize);
        stats.update(f32::from_bits(bits));
    };
    if cfg!(target_endian = "little") {
        if let Ok(words) = bytemuck::try_cast_slice::<u8, u32>(data) {
            for &w in words {
                visit(w);
            }
            return;
        }
    }
    for c in data.chunks_exact(4) {
        visit(u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
    }
}

/// Integer sweeps histogram individual bit positions of the value bits and
/// keep min/max/average in the integer domain (mean in double precision).
fn sweep_i32(data: &[u8], sets: &mut FieldSets) -> (f64, f64, f64, u64, u64) {
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    let mut sum = 0.0f64;
    let mut count = 0u64;
    let mut visit = |bits: u32| {
        sets.sign.record((bits >> 31) as usize);
        let value = bits & 0x7FFF_FFFF;
        for k in 0..31 {
            if value & (1 << k) != 0 {
                sets.mantissa.record(k);
            }
        }
        #[allow(clippy::cast_possible_wrap)]
        let v = i64::from(bits as i32);
        min = min.min(v);
        max = max.max(v);
        #[allow(clippy::cast_precision_loss)]
        {
            sum += v as f64;
        }
        count += 1;
    };
    if cfg!(target_endian = "little") {
        if let Ok(words) = bytemuck::try_cast_slice::<u8, u32>(data) {
            for &w in words {
                visit(w);
            }
        } else {
            for c in data.chunks_exact(4) {
                visit(u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            }
        }
    } else {
        for c in data.chunks_exact(4) {
            visit(u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        }
    }
    int_summary(min, max, sum, count)
}

fn sweep_u32(data: &[u8], sets: &mut FieldSets) -> (f64, f64, f64, u64, u64) {
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    let mut sum = 0.0f64;
    let mut count = 0u64;
    let mut visit = |bits: u32| {
        for k in 0..32 {
            if bits & (1 << k) != 0 {
                sets.mantissa.record(k);
            }
        }
        let v = i64::from(bits);
        min = min.min(v);
        max = max.max(v);
        #[allow(clippy::cast_precision_loss)]
        {
            sum += v as f64;
        }
        count += 1;
    };
    if cfg!(target_endian = "little") {
        if let Ok(words) = bytemuck::try_cast_slice::<u8, u32>(data) {
            for &w in words {
                visit(w);
            }
        } else {
            for c in data.chunks_exact(4) {
                visit(u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            }
        }
    } else {
        for c in data.chunks_exact(4) {
            visit(u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        }
    }
    int_summary(min, max, sum, count)
}

#[allow(clippy::cast_precision_loss)]
fn int_summary(min: i64, max: i64, sum: f64, count: u64) -> (f64, f64, f64, u64, u64) {
    if count == 0 {
        return (0.0, f64::from(f32::MAX), f64::from(f32::MIN), 0, 0);
    }
    (sum / count as f64, min as f64, max as f64, 0, 0)
}
