//! Bisection bug search over compiled methods and optimization passes.
//!
//! Finds a method which, when compiled, makes the program misbehave, then
//! narrows down the optimization pass which, when run for that method,
//! first introduces the failure.
//!
//! Both phases assume the probe is monotonic: passing for every prefix up
//! to some threshold and failing from there on. This is not checked; a
//! non-monotonic failure yields an arbitrary boundary.

use crate::error::BisectionError;
use crate::testable::{Method, OptimizationPass, Testable};
use anyhow::Result;
use serde::Serialize;
use std::convert::Infallible;
use tracing::info;

/// Result of a completed search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchOutcome {
    /// The program passes even with every method compiled.
    NoBug,
    /// Compiling `method` breaks the program even with only mandatory passes.
    FaultyMethod { method: Method },
    /// Running passes up to and excluding `pass` for `method` passes, and up
    /// to and including it fails.
    FaultyMethodAndPass { method: Method, pass: OptimizationPass },
}

/// Smallest index in `[start, end)` for which `test` is false, or `end`.
///
/// `test` must hold for a prefix of the range and fail for the rest. Each
/// index is probed at most once.
pub fn binary_search<F>(start: usize, end: usize, mut test: F) -> usize
where
    F: FnMut(usize) -> bool,
{
    match try_binary_search(start, end, |mid| Ok::<_, Infallible>(test(mid))) {
        Ok(idx) => idx,
        Err(never) => match never {},
    }
}

/// [`binary_search`] with a fallible probe; the first error stops the search.
pub fn try_binary_search<F, E>(mut start: usize, mut end: usize, mut test: F) -> Result<usize, E>
where
    F: FnMut(usize) -> Result<bool, E>,
{
    while start < end {
        let mid = start + (end - start) / 2;
        if test(mid)? {
            start = mid + 1;
        } else {
            end = mid;
        }
    }
    Ok(start)
}

/// Passes positioned before `cutoff_idx`, plus every mandatory pass.
pub fn filter_passes(passes: &[OptimizationPass], cutoff_idx: usize) -> Vec<OptimizationPass> {
    passes
        .iter()
        .enumerate()
        .filter(|(idx, pass)| pass.mandatory || *idx < cutoff_idx)
        .map(|(_, pass)| pass.clone())
        .collect()
}

/// Finds the faulty (method, pass) pair for `testable`.
pub fn bug_search<T: Testable + ?Sized>(testable: &mut T) -> Result<SearchOutcome> {
    let all_methods = testable.all_methods()?;
    info!(methods = all_methods.len(), "searching for faulty method");

    let faulty_method_idx = try_binary_search(0, all_methods.len(), |mid| {
        testable.test(Some(&all_methods[..mid]), None)
    })?;
    if faulty_method_idx == all_methods.len() {
        info!("test passes with every method compiled");
        return Ok(SearchOutcome::NoBug);
    }
    if faulty_method_idx == 0 {
        return Err(BisectionError::ContractViolation(
            "testable fails with no methods compiled".to_string(),
        )
        .into());
    }
    let faulty_method = all_methods[faulty_method_idx - 1].clone();

    let all_passes = testable.all_passes_for_method(&faulty_method)?;
    info!(method = %faulty_method, passes = all_passes.len(), "searching for faulty pass");

    let method_only = std::slice::from_ref(&faulty_method);
    let faulty_pass_idx = try_binary_search(0, all_passes.len(), |mid| {
        testable.test(Some(method_only), Some(&filter_passes(&all_passes, mid)))
    })?;
    if faulty_pass_idx == 0 {
        info!(method = %faulty_method, "fails with just mandatory passes");
        return Ok(SearchOutcome::FaultyMethod {
            method: faulty_method,
        });
    }
    if faulty_pass_idx == all_passes.len() {
        return Err(BisectionError::ContractViolation(format!(
            "test passes for faulty method {} with every pass run",
            faulty_method
        ))
        .into());
    }
    let faulty_pass = all_passes[faulty_pass_idx - 1].clone();
    info!(method = %faulty_method, pass = %faulty_pass, "found faulty pass");
    Ok(SearchOutcome::FaultyMethodAndPass {
        method: faulty_method,
        pass: faulty_pass,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Fails iff the faulty method is compiled and, when a pass filter is
    /// given, the faulty pass is in it.
    struct ModelTestable {
        methods: Vec<Method>,
        passes: Vec<OptimizationPass>,
        faulty_method: Option<Method>,
        faulty_pass: Option<String>,
        calls: Vec<(Option<Vec<Method>>, Option<Vec<OptimizationPass>>)>,
    }

    impl ModelTestable {
        fn new(method_count: usize, pass_count: usize) -> Self {
            Self {
                methods: (0..method_count).map(|i| Method::new(format!("method_{}", i))).collect(),
                passes: (0..pass_count).map(|i| OptimizationPass::new(format!("pass_{}", i))).collect(),
                faulty_method: None,
                faulty_pass: None,
                calls: Vec::new(),
            }
        }

        fn faulty(mut self, method: usize, pass: Option<usize>) -> Self {
            self.faulty_method = Some(Method::new(format!("method_{}", method)));
            self.faulty_pass = pass.map(|p| format!("pass_{}", p));
            self
        }

        fn mandatory(mut self, pass: usize) -> Self {
            self.passes[pass].mandatory = true;
            self
        }
    }

    impl Testable for ModelTestable {
        fn test(
            &mut self,
            compiled_methods: Option<&[Method]>,
            passes_to_run: Option<&[OptimizationPass]>,
        ) -> Result<bool> {
            self.calls
                .push((compiled_methods.map(<[Method]>::to_vec), passes_to_run.map(<[OptimizationPass]>::to_vec)));
            let Some(faulty_method) = &self.faulty_method else {
                return Ok(true);
            };
            let method_present = compiled_methods.map_or(true, |m| m.contains(faulty_method));
            let pass_present = match (&self.faulty_pass, passes_to_run) {
                (None, _) | (_, None) => true,
                (Some(faulty), Some(passes)) => passes.iter().any(|p| &p.name == faulty),
            };
            Ok(!(method_present && pass_present))
        }

        fn all_methods(&mut self) -> Result<Vec<Method>> {
            Ok(self.methods.clone())
        }

        fn all_passes_for_method(&mut self, _method: &Method) -> Result<Vec<OptimizationPass>> {
            Ok(self.passes.clone())
        }
    }

    /// Answers every probe the same way.
    struct ConstantTestable(bool);

    impl Testable for ConstantTestable {
        fn test(&mut self, _: Option<&[Method]>, _: Option<&[OptimizationPass]>) -> Result<bool> {
            Ok(self.0)
        }

        fn all_methods(&mut self) -> Result<Vec<Method>> {
            Ok((0..10).map(|i| Method::new(format!("method_{}", i))).collect())
        }

        fn all_passes_for_method(&mut self, _method: &Method) -> Result<Vec<OptimizationPass>> {
            Ok((0..10).map(|i| OptimizationPass::new(format!("pass_{}", i))).collect())
        }
    }

    #[test]
    fn test_binary_search_every_threshold() {
        for n in 0..40 {
            for threshold in 0..=n {
                assert_eq!(binary_search(0, n, |i| i < threshold), threshold, "n={} t={}", n, threshold);
            }
        }
    }

    #[test]
    fn test_binary_search_probes_each_index_once() {
        let mut seen = HashSet::new();
        let found = binary_search(0, 1000, |i| {
            assert!(seen.insert(i), "index {} probed twice", i);
            i < 613
        });
        assert_eq!(found, 613);
        assert!(seen.len() <= 11);
    }

    #[test]
    fn test_binary_search_respects_start_offset() {
        assert_eq!(binary_search(5, 5, |_| false), 5);
        assert_eq!(binary_search(5, 20, |i| i < 9), 9);
        assert_eq!(binary_search(5, 20, |_| true), 20);
    }

    #[test]
    fn test_try_binary_search_stops_on_error() {
        let mut calls = 0;
        let result: Result<usize, &str> = try_binary_search(0, 100, |_| {
            calls += 1;
            Err("probe failed to start")
        });
        assert_eq!(result, Err("probe failed to start"));
        assert_eq!(calls, 1);
    }

    proptest! {
        #[test]
        fn prop_binary_search_finds_threshold(n in 0usize..5000, frac in 0.0f64..=1.0) {
            let threshold = ((n as f64) * frac).round() as usize;
            prop_assert_eq!(binary_search(0, n, |i| i < threshold), threshold);
        }
    }

    #[test]
    fn test_filter_passes_keeps_mandatory_at_every_cutoff() {
        let passes = vec![
            OptimizationPass::new("a"),
            OptimizationPass::mandatory("m"),
            OptimizationPass::new("b"),
            OptimizationPass::mandatory("n"),
        ];
        for cutoff in 0..=passes.len() {
            let kept = filter_passes(&passes, cutoff);
            assert!(kept.iter().any(|p| p.name == "m"));
            assert!(kept.iter().any(|p| p.name == "n"));
        }
        let names = |v: Vec<OptimizationPass>| v.into_iter().map(|p| p.name).collect::<Vec<_>>();
        assert_eq!(names(filter_passes(&passes, 0)), vec!["m", "n"]);
        assert_eq!(names(filter_passes(&passes, 1)), vec!["a", "m", "n"]);
        assert_eq!(names(filter_passes(&passes, 3)), vec!["a", "m", "b", "n"]);
    }

    #[test]
    fn test_no_bug_when_test_always_passes() {
        assert_eq!(bug_search(&mut ConstantTestable(true)).unwrap(), SearchOutcome::NoBug);
    }

    #[test]
    fn test_contract_violation_when_test_always_fails() {
        let err = bug_search(&mut ConstantTestable(false)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BisectionError>(),
            Some(BisectionError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_faulty_method_without_faulty_pass() {
        let mut testable = ModelTestable::new(20, 8).faulty(11, None);
        assert_eq!(
            bug_search(&mut testable).unwrap(),
            SearchOutcome::FaultyMethod {
                method: Method::new("method_11")
            }
        );
    }

    #[test]
    fn test_reference_scenario_finds_method_and_pass() {
        let mut testable = ModelTestable::new(93, 73).faulty(37, Some(44)).mandatory(12);
        let outcome = bug_search(&mut testable).unwrap();
        assert_eq!(
            outcome,
            SearchOutcome::FaultyMethodAndPass {
                method: Method::new("method_37"),
                pass: OptimizationPass::new("pass_44"),
            }
        );

        let pass_probes: Vec<_> = testable
            .calls
            .iter()
            .filter_map(|(_, passes)| passes.as_ref())
            .collect();
        assert!(!pass_probes.is_empty());
        for passes in pass_probes {
            assert!(passes.iter().any(|p| p.name == "pass_12" && p.mandatory));
        }
        for (methods, passes) in &testable.calls {
            if passes.is_some() {
                assert_eq!(methods.as_deref(), Some(&[Method::new("method_37")][..]));
            }
        }
    }

    #[test]
    fn test_faulty_first_method() {
        let mut testable = ModelTestable::new(5, 6).faulty(0, Some(4));
        assert_eq!(
            bug_search(&mut testable).unwrap(),
            SearchOutcome::FaultyMethodAndPass {
                method: Method::new("method_0"),
                pass: OptimizationPass::new("pass_4"),
            }
        );
    }

    #[test]
    fn test_faulty_mandatory_pass_blames_method_only() {
        let mut testable = ModelTestable::new(5, 6).faulty(3, Some(4)).mandatory(4);
        assert_eq!(
            bug_search(&mut testable).unwrap(),
            SearchOutcome::FaultyMethod {
                method: Method::new("method_3")
            }
        );
    }

    #[test]
    fn test_inconsistent_pass_phase_is_contract_violation() {
        // The failure disappears once the method is compiled alone.
        struct Inconsistent;
        impl Testable for Inconsistent {
            fn test(&mut self, methods: Option<&[Method]>, passes: Option<&[OptimizationPass]>) -> Result<bool> {
                Ok(passes.is_some() || methods.map_or(false, |m| m.len() < 3))
            }
            fn all_methods(&mut self) -> Result<Vec<Method>> {
                Ok((0..5).map(|i| Method::new(format!("method_{}", i))).collect())
            }
            fn all_passes_for_method(&mut self, _: &Method) -> Result<Vec<OptimizationPass>> {
                Ok(vec![OptimizationPass::new("inliner"), OptimizationPass::new("licm")])
            }
        }

        let err = bug_search(&mut Inconsistent).unwrap_err();
        assert!(err.to_string().contains("method_2"));
    }
}
