//! Minimal NPY / NPZ reader for the speaker-embedding artifact.
//!
//! Supports what `numpy.save` / `numpy.savez` produce for a plain float
//! matrix:
//!   - NPY format versions 1.x, 2.x and 3.x
//!   - `float32` and `float64` dtypes, either byte order (converted to `f32`)
//!   - C-contiguous (row-major) layout
//!
//! NPZ files are ZIP archives whose members are `.npy` files; the member name
//! without its extension is the array name.

use std::{collections::BTreeMap, io::Read, path::Path};

use anyhow::{bail, ensure, Context, Result};
use zip::ZipArchive;

const MAGIC: &[u8] = b"\x93NUMPY";

/// A decoded array: shape plus flat row-major data.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NpyArray {
    /// Number of rows; a 1-D array counts as a single row.
    pub fn nrows(&self) -> usize {
        match self.shape.len() {
            0 => usize::from(!self.data.is_empty()),
            1 => 1,
            _ => self.shape[0],
        }
    }

    /// Length of one row (product of every dimension after the first).
    pub fn ncols(&self) -> usize {
        match self.shape.len() {
            0 => self.data.len(),
            1 => self.shape[0],
            _ => self.shape[1..].iter().product(),
        }
    }

    pub fn row(&self, i: usize) -> Option<&[f32]> {
        let ncols = self.ncols();
        if i >= self.nrows() {
            return None;
        }
        self.data.get(i * ncols..(i + 1) * ncols)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NPY parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    F32 { big_endian: bool },
    F64 { big_endian: bool },
}

impl Dtype {
    fn parse(descr: &str) -> Result<Self> {
        let big_endian = descr.starts_with('>');
        match descr.trim_start_matches(['<', '>', '=', '|']) {
            "f4" => Ok(Self::F32 { big_endian }),
            "f8" => Ok(Self::F64 { big_endian }),
            _ => bail!("unsupported dtype '{descr}' (expected float32 or float64)"),
        }
    }

    fn width(self) -> usize {
        match self {
            Self::F32 { .. } => 4,
            Self::F64 { .. } => 8,
        }
    }

    fn decode(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            Self::F32 { big_endian } => bytes
                .chunks_exact(4)
                .map(|b| {
                    let b = [b[0], b[1], b[2], b[3]];
                    if big_endian { f32::from_be_bytes(b) } else { f32::from_le_bytes(b) }
                })
                .collect(),
            Self::F64 { big_endian } => bytes
                .chunks_exact(8)
                .map(|b| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    let v = if big_endian {
                        f64::from_be_bytes(raw)
                    } else {
                        f64::from_le_bytes(raw)
                    };
                    v as f32
                })
                .collect(),
        }
    }
}

/// Decode a complete `.npy` byte buffer.
pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray> {
    ensure!(bytes.len() >= 10 && bytes.starts_with(MAGIC), "not an NPY file (bad magic)");

    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            ensure!(bytes.len() >= 12, "NPY v{major} file too short");
            (u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize, 12)
        }
        v => bail!("unsupported NPY version {v}.{}", bytes[7]),
    };
    let body_start = header_start + header_len;
    ensure!(bytes.len() >= body_start, "NPY header truncated");

    let header = std::str::from_utf8(&bytes[header_start..body_start])
        .context("NPY header is not valid UTF-8")?;

    let dtype = Dtype::parse(header_value(header, "descr").context("NPY header missing 'descr'")?)?;
    if header_value(header, "fortran_order").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        bail!("Fortran-order arrays are not supported");
    }
    let shape = parse_shape(header_value(header, "shape").context("NPY header missing 'shape'")?)?;

    let count: usize = shape.iter().product();
    let needed = count * dtype.width();
    let body = &bytes[body_start..];
    ensure!(
        body.len() >= needed,
        "NPY data too short: expected {needed} bytes, got {}",
        body.len()
    );

    Ok(NpyArray {
        shape,
        data: dtype.decode(&body[..needed]),
    })
}

/// Pull one entry out of the Python dict literal that forms the header, e.g.
/// `{'descr': '<f4', 'fortran_order': False, 'shape': (3, 512), }`.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let start = [format!("'{key}'"), format!("\"{key}\"")]
        .iter()
        .find_map(|k| header.find(k.as_str()).map(|p| p + k.len()))?;
    let rest = header[start..].trim_start().strip_prefix(':')?.trim_start();

    match rest.chars().next()? {
        '(' => rest.find(')').map(|end| &rest[..=end]),
        q @ ('\'' | '"') => {
            let inner = &rest[1..];
            inner.find(q).map(|end| &inner[..end])
        }
        _ => {
            let end = rest.find([',', '}']).unwrap_or(rest.len());
            Some(rest[..end].trim())
        }
    }
}

/// `(3, 512)`, `(512,)` or `()`.
fn parse_shape(tuple: &str) -> Result<Vec<usize>> {
    tuple
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<usize>().with_context(|| format!("bad shape dimension '{t}'")))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// File loaders
// ─────────────────────────────────────────────────────────────────────────────

/// Load a single `.npy` file.
pub fn load_npy(path: &Path) -> Result<NpyArray> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("cannot read NPY file: {}", path.display()))?;
    parse_npy(&bytes).with_context(|| format!("cannot parse NPY file: {}", path.display()))
}

/// Load every array of an `.npz` archive, keyed by member name.
pub fn load_npz(path: &Path) -> Result<BTreeMap<String, NpyArray>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open NPZ file: {}", path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("not a ZIP archive: {}", path.display()))?;

    let mut arrays = BTreeMap::new();
    for i in 0..archive.len() {
        let mut member = archive.by_index(i).context("failed to read ZIP entry")?;
        let name = member.name().trim_end_matches(".npy").to_string();
        let mut buf = Vec::with_capacity(member.size() as usize);
        member
            .read_to_end(&mut buf)
            .with_context(|| format!("failed to read NPZ member '{name}'"))?;
        let array = parse_npy(&buf).with_context(|| format!("bad NPZ member '{name}'"))?;
        arrays.insert(name, array);
    }
    Ok(arrays)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
