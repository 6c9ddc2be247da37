//! Sweep plans: the dimensions of a nested parameter sweep.
//!
//! The first declared dimension is the outermost loop, the last one varies
//! fastest. Coordinates are enumerated in odometer order by [`CoordinateIter`].

use crate::error::{AppResult, DaqError};
use crate::hardware::handle::{InstrumentHandle, Setter};
use std::fmt;

/// One sweep dimension, bound to the setter it drives.
#[derive(Debug, Clone)]
pub struct ParameterIteration {
    /// Parameter name (e.g. "temperature")
    pub name: String,
    /// Unit appended to values in sink paths (e.g. "K")
    pub unit: String,
    /// Registered name of the instrument driven by this dimension
    pub instrument: String,
    /// Setter name, kept for reporting only
    pub method: String,
    /// Values in sweep order
    pub values: Vec<f64>,
    setter: Setter,
}

impl ParameterIteration {
    /// Resolve `method` on `handle` and capture it.
    ///
    /// Fails with `Validation` if the handle has no such setter or `values`
    /// is empty or contains non-finite numbers.
    pub fn bind(
        name: impl Into<String>,
        unit: impl Into<String>,
        instrument: impl Into<String>,
        handle: &InstrumentHandle,
        method: &str,
        values: Vec<f64>,
    ) -> AppResult<Self> {
        let instrument = instrument.into();
        let setter = handle.setter(method).ok_or_else(|| {
            DaqError::Validation(format!(
                "instrument '{instrument}' has no setter '{method}' (available: {})",
                handle.setter_names().join(", ")
            ))
        })?;
        if values.is_empty() {
            return Err(DaqError::Validation(format!(
                "no values given for '{method}' on '{instrument}'"
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DaqError::Validation(format!(
                "values for '{method}' on '{instrument}' must be finite"
            )));
        }
        Ok(Self {
            name: name.into(),
            unit: unit.into(),
            instrument,
            method: method.to_string(),
            values,
            setter,
        })
    }

    /// The captured setter
    pub fn setter(&self) -> &Setter {
        &self.setter
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false for a bound dimension
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `"<value><unit>"`, the label used in sink group names
    pub fn label(&self, index: usize) -> String {
        format!("{}{}", self.values[index], self.unit)
    }
}

/// Ordered sweep dimensions.
#[derive(Debug, Clone, Default)]
pub struct SweepPlan {
    dimensions: Vec<ParameterIteration>,
}

impl SweepPlan {
    /// Plan without dimensions (a single measurement)
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next-inner dimension
    pub fn push(&mut self, dimension: ParameterIteration) {
        self.dimensions.push(dimension);
    }

    /// Dimensions, outermost first
    pub fn dimensions(&self) -> &[ParameterIteration] {
        &self.dimensions
    }

    /// Length of each dimension, outermost first
    pub fn lengths(&self) -> Vec<usize> {
        self.dimensions.iter().map(ParameterIteration::len).collect()
    }

    /// Number of coordinate tuples (1 for an empty plan)
    pub fn tuple_count(&self) -> usize {
        self.dimensions.iter().map(ParameterIteration::len).product()
    }

    /// Coordinate tuples in odometer order
    pub fn coordinates(&self) -> CoordinateIter {
        CoordinateIter::new(self.lengths())
    }

    /// Remove all dimensions
    pub fn clear(&mut self) {
        self.dimensions.clear();
    }

    /// Sink group path for the tuple `indices`: values joined by `" - "`
    /// under `raw_data`.
    pub fn group_path(&self, indices: &[usize]) -> String {
        if self.dimensions.is_empty() {
            return "raw_data".to_string();
        }
        let labels: Vec<String> = self
            .dimensions
            .iter()
            .zip(indices)
            .map(|(dim, &i)| dim.label(i))
            .collect();
        format!("raw_data/{}", labels.join(" - "))
    }
}

impl fmt::Display for SweepPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dimensions.is_empty() {
            return writeln!(f, "  (no sweep dimensions)");
        }
        for (depth, dim) in self.dimensions.iter().enumerate() {
            writeln!(
                f,
                "  {}{} [{}] via {}.{}: {} values {:?}",
                "  ".repeat(depth),
                dim.name,
                dim.unit,
                dim.instrument,
                dim.method,
                dim.len(),
                dim.values
            )?;
        }
        Ok(())
    }
}

/// Mixed-radix counter over dimension lengths, incremented from the right.
///
/// An empty length list yields exactly one empty tuple; any zero length
/// yields nothing.
#[derive(Debug, Clone)]
pub struct CoordinateIter {
    lengths: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl CoordinateIter {
    /// Counter starting at all zeros
    pub fn new(lengths: Vec<usize>) -> Self {
        let next = if lengths.iter().all(|&l| l > 0) {
            Some(vec![0; lengths.len()])
        } else {
            None
        };
        Self { lengths, next }
    }
}

impl Iterator for CoordinateIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut following = current.clone();
        for dim in (0..following.len()).rev() {
            following[dim] += 1;
            if following[dim] < self.lengths[dim] {
                self.next = Some(following);
                break;
            }
            following[dim] = 0;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockCryostat;
    use std::sync::Arc;

    #[test]
    fn odometer_order_last_dimension_fastest() {
        let tuples: Vec<Vec<usize>> = CoordinateIter::new(vec![2, 3]).collect();
        assert_eq!(
            tuples,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ]
        );
    }

    #[test]
    fn odometer_counts_match_product() {
        assert_eq!(CoordinateIter::new(vec![3, 1, 4]).count(), 12);
        assert_eq!(CoordinateIter::new(vec![]).collect::<Vec<_>>(), vec![Vec::<usize>::new()]);
        assert_eq!(CoordinateIter::new(vec![2, 0]).count(), 0);
    }

    #[test]
    fn binding_requires_known_setter_and_values() {
        let handle = Arc::new(MockCryostat::new()).handle();
        let err = ParameterIteration::bind("T", "K", "cryo", &handle, "set_pressure", vec![1.0])
            .unwrap_err();
        assert!(matches!(err, DaqError::Validation(msg) if msg.contains("set_temperature")));

        assert!(
            ParameterIteration::bind("T", "K", "cryo", &handle, "set_temperature", vec![]).is_err()
        );
        assert!(ParameterIteration::bind(
            "T",
            "K",
            "cryo",
            &handle,
            "set_temperature",
            vec![f64::NAN]
        )
        .is_err());
    }

    #[test]
    fn group_path_joins_values_and_units() {
        let handle = Arc::new(MockCryostat::new()).handle();
        let mut plan = SweepPlan::new();
        assert_eq!(plan.group_path(&[]), "raw_data");

        plan.push(
            ParameterIteration::bind("T", "K", "cryo", &handle, "set_temperature", vec![10.0, 20.5])
                .unwrap(),
        );
        plan.push(
            ParameterIteration::bind("P", "mW", "cryo", &handle, "set_temperature", vec![1.0, 2.0, 3.0])
                .unwrap(),
        );
        assert_eq!(plan.tuple_count(), 6);
        assert_eq!(plan.group_path(&[1, 2]), "raw_data/20.5K - 3mW");
    }
}
