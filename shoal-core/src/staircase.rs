//! Left-continuous staircase function.
//!
//! Upper layers describe length-dependent cost multipliers as a step
//! function: `y = F(x) = F_i if x <= x_i`, falling back to a default above
//! the last step. The default occupies a sentinel step at `u64::MAX`, so a
//! lookup always lands on some step.

use std::fmt;

/// A left-continuous step function from `u64` to `T`.
///
/// Steps are keyed by their inclusive upper bound; `at(x)` returns the value
/// of the lowest step whose upper bound is >= `x`. In particular `at(0)`
/// returns the value of the first step.
#[derive(Debug, Clone)]
pub struct Staircase<T> {
    steps: Vec<(u64, T)>,
}

impl<T: Copy> Staircase<T> {
    /// Constructs the staircase with `default` as the value above all steps.
    #[must_use]
    pub fn new(default: T) -> Self {
        Self {
            steps: vec![(u64::MAX, default)],
        }
    }

    /// Returns the value corresponding to `x`.
    #[must_use]
    pub fn at(&self, x: u64) -> T {
        for &(bound, value) in &self.steps {
            if x <= bound {
                return value;
            }
        }
        unreachable!("the sentinel step covers the whole x-range");
    }

    /// Adds a step with inclusive upper bound `x` and value `y`.
    ///
    /// # Panics
    ///
    /// Panics if `x` is `u64::MAX`, which is reserved for the default step.
    pub fn add_step(&mut self, x: u64, y: T) {
        assert!(x != u64::MAX, "cannot add a step at the end of the x-range");
        let pos = self
            .steps
            .iter()
            .position(|&(bound, _)| bound >= x)
            .unwrap_or(self.steps.len());
        self.steps.insert(pos, (x, y));
    }

    /// Changes the default value to `y`.
    pub fn set_default(&mut self, y: T) {
        if let Some(last) = self.steps.last_mut() {
            last.1 = y;
        }
    }

    /// Returns the current default value.
    #[must_use]
    pub fn get_default(&self) -> T {
        self.steps.last().map(|&(_, value)| value).unwrap_or_else(|| {
            unreachable!("the sentinel step is never removed");
        })
    }
}

impl<T: Copy + fmt::Display> fmt::Display for Staircase<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "staircase[")?;
        for (i, &(bound, value)) in self.steps.iter().enumerate() {
            if i == self.steps.len() - 1 {
                write!(f, " *:{value}")?;
            } else {
                write!(f, " {bound}:{value}")?;
            }
        }
        write!(f, " ]")
    }
}
