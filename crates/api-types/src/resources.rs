//! Resource vectors for quota arithmetic.
//!
//! All quota math runs on [`ResourceList`]: cpu is stored in milli-units so
//! requests below one core never lose precision, memory and extended
//! resources in their base units.

use std::collections::BTreeMap;
use std::fmt;

use error_stack::{Report, ResultExt};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::ObjectParseError;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";

/// A resource vector keyed by resource name. Missing dimensions count as
/// zero in all comparisons and arithmetic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, i64>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, resource: &str, value: i64) -> Self {
        self.0.insert(resource.to_string(), value);
        self
    }

    pub fn get(&self, resource: &str) -> i64 {
        self.0.get(resource).copied().unwrap_or(0)
    }

    pub fn set(&mut self, resource: &str, value: i64) {
        self.0.insert(resource.to_string(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_zero(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    fn union_names<'a>(&'a self, other: &'a Self) -> impl Iterator<Item = &'a str> {
        let mut names: Vec<&str> = self.0.keys().chain(other.0.keys()).map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        names.into_iter()
    }

    fn zip_with(&self, other: &Self, f: impl Fn(i64, i64) -> i64) -> Self {
        let mut out = BTreeMap::new();
        for name in self.union_names(other) {
            out.insert(name.to_string(), f(self.get(name), other.get(name)));
        }
        Self(out)
    }

    pub fn add(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn add_assign(&mut self, other: &Self) {
        *self = self.add(other);
    }

    /// Signed subtraction; deltas may be negative per dimension.
    pub fn sub(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn sub_assign(&mut self, other: &Self) {
        *self = self.sub(other);
    }

    /// Subtraction clamped at zero per dimension.
    pub fn sub_clamp_zero(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| (a - b).max(0))
    }

    pub fn min(&self, other: &Self) -> Self {
        self.zip_with(other, i64::min)
    }

    pub fn max(&self, other: &Self) -> Self {
        self.zip_with(other, i64::max)
    }

    /// Keep only the dimensions present in `dims`.
    pub fn mask(&self, dims: &Self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(name, _)| dims.0.contains_key(*name))
                .map(|(name, value)| (name.clone(), *value))
                .collect(),
        )
    }

    /// Compare against an upper bound, ignoring dimensions the bound does not
    /// track. Returns whether the vector fits and the sorted list of exceeded
    /// dimensions. A dimension absent from `bound` is ungoverned and never
    /// exceeds.
    pub fn less_equal_governed(&self, bound: &Self) -> (bool, Vec<String>) {
        let mut exceeded = Vec::new();
        for (name, value) in &self.0 {
            if let Some(limit) = bound.0.get(name) {
                if value > limit {
                    exceeded.push(name.clone());
                }
            }
        }
        (exceeded.is_empty(), exceeded)
    }

    /// Render back into Kubernetes quantity strings (cpu as milli, others as
    /// base units), the inverse of [`parse_quantity_map`].
    pub fn to_quantity_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(name, value)| {
                let quantity = if name == RESOURCE_CPU {
                    format!("{value}m")
                } else {
                    value.to_string()
                };
                (name.clone(), quantity)
            })
            .collect()
    }

    /// Strict comparison: a dimension missing from `bound` counts as zero.
    pub fn less_equal_strict(&self, bound: &Self) -> (bool, Vec<String>) {
        let mut exceeded = Vec::new();
        for (name, value) in &self.0 {
            if *value > bound.get(name) {
                exceeded.push(name.clone());
            }
        }
        (exceeded.is_empty(), exceeded)
    }
}

impl PartialEq for ResourceList {
    /// Vectors are equal when every dimension matches, with missing entries
    /// counting as zero.
    fn eq(&self, other: &Self) -> bool {
        self.union_names(other)
            .all(|name| self.get(name) == other.get(name))
    }
}

impl Eq for ResourceList {}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(f, "{{")?;
        for (name, value) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if name == RESOURCE_CPU {
                write!(f, "{name}:{value}m")?;
            } else {
                write!(f, "{name}:{value}")?;
            }
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, i64)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parse a Kubernetes quantity string into engine units for `resource`.
///
/// cpu accepts "100m", "1", "1.5" and is returned in milli-units. Other
/// resources accept plain integers, decimals, binary suffixes (Ki..Ei) and
/// decimal suffixes (k..E) and are returned in base units.
pub fn parse_quantity(resource: &str, value: &str) -> Result<i64, Report<ObjectParseError>> {
    let trimmed = value.trim();
    if resource == RESOURCE_CPU {
        return parse_cpu_milli(trimmed).ok_or_else(|| invalid(resource, value));
    }
    parse_scaled(trimmed).ok_or_else(|| invalid(resource, value))
}

fn invalid(resource: &str, value: &str) -> Report<ObjectParseError> {
    Report::new(ObjectParseError::InvalidQuantity {
        resource: resource.to_string(),
        value: value.to_string(),
    })
}

fn parse_cpu_milli(value: &str) -> Option<i64> {
    if let Some(milli) = value.strip_suffix('m') {
        return milli.parse::<i64>().ok();
    }
    let cores: f64 = value.parse().ok()?;
    if !cores.is_finite() || cores < 0.0 {
        return None;
    }
    Some((cores * 1000.0).round() as i64)
}

fn parse_scaled(value: &str) -> Option<i64> {
    if let Ok(plain) = value.parse::<i64>() {
        return Some(plain);
    }

    let split = value.find(|c: char| c.is_alphabetic())?;
    let (numeric, suffix) = value.split_at(split);
    let base: f64 = numeric.parse().ok()?;
    let multiplier: f64 = match suffix {
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0f64.powi(4),
        "Pi" => 1024.0f64.powi(5),
        "Ei" => 1024.0f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => return None,
    };
    let scaled = base * multiplier;
    if !scaled.is_finite() || scaled < 0.0 {
        return None;
    }
    Some(scaled.round() as i64)
}

/// Parse a quantity-string map (quota spec, annotations) into a vector.
pub fn parse_quantity_map(
    map: &BTreeMap<String, String>,
) -> Result<ResourceList, Report<ObjectParseError>> {
    let mut out = ResourceList::new();
    for (resource, value) in map {
        let parsed = parse_quantity(resource, value).attach_printable_lazy(|| {
            format!("while parsing resource map entry {resource}={value}")
        })?;
        out.set(resource, parsed);
    }
    Ok(out)
}

/// Parse container requests from the API object. Entries that fail to parse
/// are skipped; the API server has already validated them.
pub fn parse_k8s_requests(requests: &BTreeMap<String, Quantity>) -> ResourceList {
    let mut out = ResourceList::new();
    for (resource, quantity) in requests {
        if let Ok(parsed) = parse_quantity(resource, &quantity.0) {
            out.set(resource, parsed);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rl(cpu_milli: i64, memory: i64) -> ResourceList {
        ResourceList::new()
            .with(RESOURCE_CPU, cpu_milli)
            .with(RESOURCE_MEMORY, memory)
    }

    #[test]
    fn cpu_quantities_parse_to_milli() {
        assert_eq!(parse_quantity("cpu", "100m").unwrap(), 100);
        assert_eq!(parse_quantity("cpu", "1").unwrap(), 1_000);
        assert_eq!(parse_quantity("cpu", "1.5").unwrap(), 1_500);
        assert_eq!(parse_quantity("cpu", "0.1").unwrap(), 100);
        assert!(parse_quantity("cpu", "lots").is_err());
    }

    #[test]
    fn memory_quantities_parse_to_bytes() {
        assert_eq!(parse_quantity("memory", "160").unwrap(), 160);
        assert_eq!(parse_quantity("memory", "1Ki").unwrap(), 1024);
        assert_eq!(parse_quantity("memory", "1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_quantity("memory", "1k").unwrap(), 1000);
        assert_eq!(parse_quantity("memory", "1.5Mi").unwrap(), 3 * (1 << 20) / 2);
        assert!(parse_quantity("memory", "1Qx").is_err());
    }

    #[test]
    fn arithmetic_over_union_of_dimensions() {
        let a = rl(1_000, 100).with("nvidia.com/gpu", 1);
        let b = rl(500, 200);
        let sum = a.add(&b);
        assert_eq!(sum.get(RESOURCE_CPU), 1_500);
        assert_eq!(sum.get(RESOURCE_MEMORY), 300);
        assert_eq!(sum.get("nvidia.com/gpu"), 1);

        let diff = b.sub(&a);
        assert_eq!(diff.get(RESOURCE_CPU), -500);
        assert_eq!(diff.get("nvidia.com/gpu"), -1);

        let clamped = b.sub_clamp_zero(&a);
        assert_eq!(clamped.get(RESOURCE_CPU), 0);
        assert_eq!(clamped.get(RESOURCE_MEMORY), 100);
    }

    #[test]
    fn min_max_treat_missing_as_zero() {
        let a = rl(1_000, 100);
        let b = ResourceList::new().with(RESOURCE_CPU, 500);
        let min = a.min(&b);
        assert_eq!(min.get(RESOURCE_CPU), 500);
        assert_eq!(min.get(RESOURCE_MEMORY), 0);
        let max = a.max(&b);
        assert_eq!(max.get(RESOURCE_CPU), 1_000);
        assert_eq!(max.get(RESOURCE_MEMORY), 100);
    }

    #[test]
    fn governed_comparison_ignores_untracked_dimensions() {
        let request = rl(1_000, 2).with("nvidia.com/gpu", 1);
        let runtime = rl(0, 20);
        let (fits, exceeded) = request.less_equal_governed(&runtime);
        assert!(!fits);
        // gpu is not governed by the runtime vector, only cpu exceeds
        assert_eq!(exceeded, vec!["cpu".to_string()]);

        let (fits, exceeded) = request.less_equal_strict(&runtime);
        assert!(!fits);
        assert_eq!(exceeded, vec!["cpu".to_string(), "nvidia.com/gpu".to_string()]);
    }

    #[test]
    fn equality_ignores_explicit_zeros() {
        let a = rl(0, 100);
        let b = ResourceList::new().with(RESOURCE_MEMORY, 100);
        assert_eq!(a, b);
        assert_ne!(a, rl(1, 100));
    }

    #[test]
    fn display_is_stable_and_sorted() {
        let v = rl(60_000, 100);
        assert_eq!(v.to_string(), "{cpu:60000m,memory:100}");
        assert_eq!(ResourceList::new().to_string(), "{}");
    }

    #[test]
    fn mask_keeps_only_named_dimensions() {
        let request = rl(1_000, 2).with("nvidia.com/gpu", 1);
        let dims = rl(0, 20);
        let masked = request.mask(&dims);
        assert_eq!(masked.get(RESOURCE_CPU), 1_000);
        assert_eq!(masked.get(RESOURCE_MEMORY), 2);
        assert_eq!(masked.get("nvidia.com/gpu"), 0);
        assert!(masked.resource_names().all(|n| n != "nvidia.com/gpu"));
    }
}
