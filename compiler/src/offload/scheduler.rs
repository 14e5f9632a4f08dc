//! Iteration-space scheduling
//!
//! Maps an N-dimensional loop nest onto the device work-grid. The first three
//! dimensions are bound to hardware work-item coordinates; every further
//! dimension becomes a sequential loop nested inside each work-item.

use std::collections::HashMap;
use std::fmt::Write;

/// Number of independent hardware axes a device dispatch exposes
pub const MAX_HARDWARE_DIMS: usize = 3;

/// One dimension handed to the scheduler.
///
/// `start` and `stop` are bound symbols (variable names or literals); `stop`
/// is the inclusive last index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDim {
    pub index: String,
    pub start: String,
    pub stop: String,
}

impl ScheduleDim {
    pub fn new(index: impl Into<String>, start: impl Into<String>, stop: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            start: start.into(),
            stop: stop.into(),
        }
    }
}

/// `index = get_global_id(axis)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItemBinding {
    pub index: String,
    pub axis: u32,
}

/// `for index in start..=stop`, nested `depth` levels inside the work-item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialLoop {
    pub index: String,
    pub start: String,
    pub stop: String,
    pub depth: usize,
}

/// Kernel prologue produced by [`schedule_loop`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSchedule {
    pub work_items: Vec<WorkItemBinding>,

    /// Outermost first
    pub sequential_loops: Vec<SequentialLoop>,
}

impl KernelSchedule {
    /// Number of bound hardware axes.
    pub fn hardware_dims(&self) -> usize {
        self.work_items.len()
    }

    /// Nesting depth of the innermost sequential loop body.
    pub fn body_depth(&self) -> usize {
        self.sequential_loops.len()
    }

    /// Render the prologue as indented text, one statement per line.
    ///
    /// Sequential loops are indented four spaces per nesting level.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for binding in &self.work_items {
            let _ = writeln!(out, "{} = get_global_id({})", binding.index, binding.axis);
        }
        for seq in &self.sequential_loops {
            let _ = writeln!(
                out,
                "{}for {} in range({}, {} + 1):",
                "    ".repeat(seq.depth),
                seq.index,
                seq.start,
                seq.stop
            );
        }
        out
    }
}

/// Schedule `dims` onto the work-grid.
///
/// Index variables and bound symbols are looked up in `subst` and replaced
/// when present. An empty `dims` yields an empty schedule; callers reject
/// zero-dimensional nests before getting here.
pub fn schedule_loop(dims: &[ScheduleDim], subst: &HashMap<String, String>) -> KernelSchedule {
    let lookup = |name: &str| subst.get(name).cloned().unwrap_or_else(|| name.to_string());

    let mut schedule = KernelSchedule::default();
    for (axis, dim) in dims.iter().take(MAX_HARDWARE_DIMS).enumerate() {
        schedule.work_items.push(WorkItemBinding {
            index: lookup(&dim.index),
            axis: axis as u32,
        });
    }
    for (depth, dim) in dims.iter().skip(MAX_HARDWARE_DIMS).enumerate() {
        schedule.sequential_loops.push(SequentialLoop {
            index: lookup(&dim.index),
            start: lookup(&dim.start),
            stop: lookup(&dim.stop),
            depth,
        });
    }
    schedule
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(n: usize) -> Vec<ScheduleDim> {
        (0..n)
            .map(|d| ScheduleDim::new(format!("i{}", d), format!("s{}", d), format!("e{}", d)))
            .collect()
    }

    #[test]
    fn test_up_to_three_dims_bind_hardware_axes() {
        for d in 1..=3 {
            let schedule = schedule_loop(&dims(d), &HashMap::new());
            assert_eq!(schedule.hardware_dims(), d);
            assert!(schedule.sequential_loops.is_empty());
            let axes: Vec<u32> = schedule.work_items.iter().map(|w| w.axis).collect();
            assert_eq!(axes, (0..d as u32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_excess_dims_become_nested_loops() {
        let schedule = schedule_loop(&dims(6), &HashMap::new());
        assert_eq!(schedule.hardware_dims(), 3);
        assert_eq!(schedule.sequential_loops.len(), 3);
        for (depth, seq) in schedule.sequential_loops.iter().enumerate() {
            assert_eq!(seq.depth, depth);
            assert_eq!(seq.index, format!("i{}", depth + 3));
        }

        let text = schedule.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[3], "for i3 in range(s3, e3 + 1):");
        assert_eq!(lines[4], "    for i4 in range(s4, e4 + 1):");
        assert_eq!(lines[5], "        for i5 in range(s5, e5 + 1):");
    }

    #[test]
    fn test_substitution_applies_to_indices_and_bounds() {
        let mut subst = HashMap::new();
        subst.insert("i3".to_string(), "_i3".to_string());
        subst.insert("e3".to_string(), "n_last".to_string());
        let schedule = schedule_loop(&dims(4), &subst);
        assert_eq!(schedule.sequential_loops[0].index, "_i3");
        assert_eq!(schedule.sequential_loops[0].stop, "n_last");
        assert_eq!(schedule.sequential_loops[0].start, "s3");
    }

    #[test]
    fn test_zero_dims_is_empty() {
        let schedule = schedule_loop(&[], &HashMap::new());
        assert_eq!(schedule, KernelSchedule::default());
        assert!(schedule.render().is_empty());
    }
}
