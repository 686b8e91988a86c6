//! Ensemble matrices and member output retrieval.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, CheckpointResult};

/// One parameter vector per ensemble member, member 1 first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterMatrix(Vec<Vec<f64>>);

impl ParameterMatrix {
    pub fn new(rows: Vec<Vec<f64>>) -> Self {
        Self(rows)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parameters of a 1-based member.
    pub fn member(&self, member: u32) -> Option<&[f64]> {
        let idx = (member as usize).checked_sub(1)?;
        self.0.get(idx).map(Vec::as_slice)
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.0
    }

    /// First `(member, column)` holding NaN or an infinity.
    pub fn first_non_finite(&self) -> Option<(u32, usize)> {
        self.0.iter().enumerate().find_map(|(idx, row)| {
            row.iter()
                .position(|v| !v.is_finite())
                .map(|col| (idx as u32 + 1, col))
        })
    }
}

impl From<Vec<Vec<f64>>> for ParameterMatrix {
    fn from(rows: Vec<Vec<f64>>) -> Self {
        Self(rows)
    }
}

/// Per-member output vectors for one iteration.
///
/// Always holds exactly `ensemble_size` entries. A `None` entry is the
/// sentinel for a member that exhausted its retry budget; it serializes
/// as JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnsembleOutputMatrix {
    entries: Vec<Option<Vec<f64>>>,
}

impl EnsembleOutputMatrix {
    /// All-sentinel matrix for `ensemble_size` members.
    pub fn new(ensemble_size: u32) -> Self {
        Self {
            entries: vec![None; ensemble_size as usize],
        }
    }

    pub fn from_entries(entries: Vec<Option<Vec<f64>>>) -> Self {
        Self { entries }
    }

    /// Record the output of a 1-based member. Out-of-range members are ignored.
    pub fn set(&mut self, member: u32, values: Vec<f64>) {
        if let Some(slot) = (member as usize)
            .checked_sub(1)
            .and_then(|idx| self.entries.get_mut(idx))
        {
            *slot = Some(values);
        }
    }

    pub fn get(&self, member: u32) -> Option<&[f64]> {
        let idx = (member as usize).checked_sub(1)?;
        self.entries.get(idx)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_sentinel(&self, member: u32) -> bool {
        self.get(member).is_none()
    }

    /// 1-based members carrying the sentinel.
    pub fn sentinel_members(&self) -> Vec<u32> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(idx, _)| idx as u32 + 1)
            .collect()
    }

    pub fn successful_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn entries(&self) -> &[Option<Vec<f64>>] {
        &self.entries
    }

    /// Dense rows with NaN-filled sentinel rows, for numeric consumers.
    ///
    /// The row width is taken from the first real entry.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let width = self.entries.iter().flatten().map(Vec::len).next().unwrap_or(0);
        self.entries
            .iter()
            .map(|e| match e {
                Some(values) => values.clone(),
                None => vec![f64::NAN; width],
            })
            .collect()
    }
}

/// Reads a member's forward-model output from its directory.
///
/// Retrieval happens after the barrier: cluster jobs leave their results on
/// the shared filesystem rather than returning them in-process.
pub trait OutputReader: Send + Sync {
    fn read(&self, member_dir: &Path) -> CheckpointResult<Vec<f64>>;

    /// Remove stale output left by an earlier run of the same iteration.
    fn clear(&self, member_dir: &Path) -> CheckpointResult<()>;
}

/// Reads a JSON array of numbers from a fixed file name.
#[derive(Debug, Clone)]
pub struct JsonOutputReader {
    file_name: String,
}

impl JsonOutputReader {
    pub const DEFAULT_FILE: &'static str = "output.json";

    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl Default for JsonOutputReader {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FILE)
    }
}

impl OutputReader for JsonOutputReader {
    fn read(&self, member_dir: &Path) -> CheckpointResult<Vec<f64>> {
        let path = member_dir.join(&self.file_name);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::Missing(path))
            }
            Err(e) => return Err(CheckpointError::io(path, e)),
        };
        serde_json::from_str(&raw).map_err(|e| CheckpointError::json(path, e))
    }

    fn clear(&self, member_dir: &Path) -> CheckpointResult<()> {
        let path = member_dir.join(&self.file_name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_sentinels_by_member_index() {
        let mut matrix = EnsembleOutputMatrix::new(5);
        for member in [4, 1, 3, 2] {
            matrix.set(member, vec![member as f64; 2]);
        }
        assert_eq!(matrix.len(), 5);
        assert_eq!(matrix.get(3), Some(&[3.0, 3.0][..]));
        assert_eq!(matrix.sentinel_members(), vec![5]);
        assert_eq!(matrix.successful_count(), 4);

        // Members outside 1..=ensemble_size are ignored.
        matrix.set(0, vec![9.0]);
        matrix.set(6, vec![9.0]);
        assert_eq!(matrix.len(), 5);
    }

    #[test]
    fn test_first_non_finite() {
        let finite = ParameterMatrix::new(vec![vec![1.0, -2.5], vec![0.0, 1e300]]);
        assert_eq!(finite.first_non_finite(), None);
        let bad = ParameterMatrix::new(vec![vec![1.0], vec![2.0, f64::NEG_INFINITY], vec![f64::NAN]]);
        assert_eq!(bad.first_non_finite(), Some((2, 1)));
    }

    #[test]
    fn test_dense_fills_nan() {
        let matrix = EnsembleOutputMatrix::from_entries(vec![None, Some(vec![1.0, 2.0])]);
        let dense = matrix.to_dense();
        assert_eq!(dense[0].len(), 2);
        assert!(dense[0].iter().all(|v| v.is_nan()));
        assert_eq!(dense[1], vec![1.0, 2.0]);
    }

    #[test]
    fn test_sentinel_serializes_as_null() {
        let matrix = EnsembleOutputMatrix::from_entries(vec![Some(vec![0.5]), None]);
        let json = serde_json::to_string(&matrix).unwrap();
        assert_eq!(json, "[[0.5],null]");
        let back: EnsembleOutputMatrix = serde_json::from_str(&json).unwrap();
        assert!(back.is_sentinel(2));
    }

    #[test]
    fn test_json_output_reader() {
        let dir = tempfile::tempdir().unwrap();
        let reader = JsonOutputReader::default();

        assert!(matches!(
            reader.read(dir.path()),
            Err(CheckpointError::Missing(_))
        ));

        std::fs::write(dir.path().join("output.json"), "[1.5, 2.5]").unwrap();
        assert_eq!(reader.read(dir.path()).unwrap(), vec![1.5, 2.5]);

        reader.clear(dir.path()).unwrap();
        assert!(!dir.path().join("output.json").exists());
        // Clearing twice is fine.
        reader.clear(dir.path()).unwrap();

        std::fs::write(dir.path().join("output.json"), "not json").unwrap();
        assert!(matches!(
            reader.read(dir.path()),
            Err(CheckpointError::Json { .. })
        ));
    }
}
