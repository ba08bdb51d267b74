//! VM profiling and instrumentation
//!
//! Optional counters for performance analysis. Profiling is off by default;
//! the dispatch loop only touches the profiler when one is installed.

use crate::cache::{CacheStats, Lookup};
use crate::rtl::disasm::insn_name;
use crate::rtl::Insn;
use std::collections::HashMap;

/// Which cache a lookup went to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Call,
    Const,
    Ivar,
}

/// Execution counters
///
/// Instructions are counted per name as shown by the disassembler, so the
/// generic and speculative forms of one operator are reported separately.
#[derive(Debug, Clone)]
pub struct Profiler {
    enabled: bool,
    total_instructions: u64,
    instruction_counts: HashMap<String, u64>,
    rewrites: u64,
    deopts: u64,
    call_cache: CacheStats,
    const_cache: CacheStats,
    ivar_cache: CacheStats,
}

impl Profiler {
    /// Create a new profiler (disabled by default)
    pub fn new() -> Self {
        Self {
            enabled: false,
            total_instructions: 0,
            instruction_counts: HashMap::new(),
            rewrites: 0,
            deopts: 0,
            call_cache: CacheStats::default(),
            const_cache: CacheStats::default(),
            ivar_cache: CacheStats::default(),
        }
    }

    /// Create a new profiler with profiling enabled
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::new()
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self {
            enabled: self.enabled,
            ..Self::new()
        };
    }

    /// Record an instruction execution
    pub fn record_instruction(&mut self, insn: &Insn) {
        if !self.enabled {
            return;
        }
        self.total_instructions += 1;
        *self.instruction_counts.entry(insn_name(insn)).or_insert(0) += 1;
    }

    /// Record a generic instruction rewriting itself
    pub fn record_rewrite(&mut self) {
        if self.enabled {
            self.rewrites += 1;
        }
    }

    /// Record a speculative instruction falling back
    pub fn record_deopt(&mut self) {
        if self.enabled {
            self.deopts += 1;
        }
    }

    pub fn record_cache<T>(&mut self, kind: CacheKind, lookup: &Lookup<T>) {
        if !self.enabled {
            return;
        }
        match kind {
            CacheKind::Call => self.call_cache.record(lookup),
            CacheKind::Const => self.const_cache.record(lookup),
            CacheKind::Ivar => self.ivar_cache.record(lookup),
        }
    }

    pub fn total_instructions(&self) -> u64 {
        self.total_instructions
    }

    /// Count for one instruction name (e.g. `"iplusi"`)
    pub fn instruction_count(&self, name: &str) -> u64 {
        self.instruction_counts.get(name).copied().unwrap_or(0)
    }

    pub fn instruction_counts(&self) -> &HashMap<String, u64> {
        &self.instruction_counts
    }

    pub fn rewrites(&self) -> u64 {
        self.rewrites
    }

    pub fn deopts(&self) -> u64 {
        self.deopts
    }

    pub fn cache_stats(&self, kind: CacheKind) -> CacheStats {
        match kind {
            CacheKind::Call => self.call_cache,
            CacheKind::Const => self.const_cache,
            CacheKind::Ivar => self.ivar_cache,
        }
    }

    /// Generate a profiling report
    pub fn report(&self) -> String {
        if !self.enabled {
            return "Profiling not enabled".to_string();
        }

        let mut report = String::new();
        report.push_str(&format!(
            "Total instructions executed: {}\n",
            self.total_instructions
        ));
        report.push_str(&format!(
            "Rewrites: {}  Deoptimizations: {}\n\n",
            self.rewrites, self.deopts
        ));

        if self.instruction_counts.is_empty() {
            report.push_str("No instructions recorded\n");
            return report;
        }

        report.push_str("Instruction counts:\n");

        // By count, then by name so reports are stable
        let mut counts: Vec<_> = self.instruction_counts.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        for (name, count) in counts {
            let percentage = (*count as f64 / self.total_instructions as f64) * 100.0;
            report.push_str(&format!(
                "  {:<24} {:>10} ({:>6.2}%)\n",
                name, count, percentage
            ));
        }

        report.push_str("\nCaches:\n");
        for (label, stats) in [
            ("call", self.call_cache),
            ("const", self.const_cache),
            ("ivar", self.ivar_cache),
        ] {
            report.push_str(&format!(
                "  {:<6} hits {:>8}  misses {:>8}  stale {:>8}  ({:.2}% hit)\n",
                label,
                stats.hits,
                stats.misses,
                stats.stale,
                stats.hit_rate()
            ));
        }

        report
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::Literal;
    use crate::rtl::{BinOp, Operand, Slot, Variant, VariantCell};
    use pretty_assertions::assert_eq;

    fn plus(variant: Variant) -> Insn {
        Insn::Binary {
            op: BinOp::Plus,
            dst: 0,
            lhs: Slot::Local(0),
            rhs: Operand::Imm(Literal::Int(1)),
            cd: 0,
            variant: VariantCell::new(variant),
        }
    }

    #[test]
    fn test_profiler_new() {
        let profiler = Profiler::new();
        assert!(!profiler.is_enabled());
        assert_eq!(profiler.total_instructions(), 0);
    }

    #[test]
    fn test_enable_disable() {
        let mut profiler = Profiler::new();
        profiler.enable();
        assert!(profiler.is_enabled());
        profiler.disable();
        assert!(!profiler.is_enabled());
    }

    #[test]
    fn test_counts_by_variant_name() {
        let mut profiler = Profiler::enabled();
        profiler.record_instruction(&plus(Variant::Generic));
        profiler.record_instruction(&plus(Variant::Fixnum));
        profiler.record_instruction(&plus(Variant::Fixnum));

        assert_eq!(profiler.total_instructions(), 3);
        assert_eq!(profiler.instruction_count("plusi"), 1);
        assert_eq!(profiler.instruction_count("iplusi"), 2);
    }

    #[test]
    fn test_record_when_disabled() {
        let mut profiler = Profiler::new();
        profiler.record_instruction(&Insn::Nop);
        profiler.record_rewrite();
        profiler.record_cache(CacheKind::Call, &Lookup::Hit(()));

        assert_eq!(profiler.total_instructions(), 0);
        assert_eq!(profiler.rewrites(), 0);
        assert_eq!(profiler.cache_stats(CacheKind::Call).hits, 0);
    }

    #[test]
    fn test_reset_keeps_enabled() {
        let mut profiler = Profiler::enabled();
        profiler.record_instruction(&Insn::Nop);
        profiler.record_deopt();
        profiler.reset();

        assert!(profiler.is_enabled());
        assert_eq!(profiler.total_instructions(), 0);
        assert_eq!(profiler.deopts(), 0);
    }

    #[test]
    fn test_cache_stats_per_kind() {
        let mut profiler = Profiler::enabled();
        profiler.record_cache(CacheKind::Const, &Lookup::Hit(()));
        profiler.record_cache::<()>(CacheKind::Const, &Lookup::Stale);
        profiler.record_cache::<()>(CacheKind::Ivar, &Lookup::Miss);

        let consts = profiler.cache_stats(CacheKind::Const);
        assert_eq!((consts.hits, consts.misses, consts.stale), (1, 1, 1));
        assert_eq!(profiler.cache_stats(CacheKind::Ivar).misses, 1);
        assert_eq!(profiler.cache_stats(CacheKind::Call).misses, 0);
    }

    #[test]
    fn test_report_with_data() {
        let mut profiler = Profiler::enabled();
        profiler.record_instruction(&Insn::Nop);
        profiler.record_instruction(&Insn::Nop);
        profiler.record_instruction(&plus(Variant::Generic));
        profiler.record_rewrite();

        let report = profiler.report();
        assert!(report.contains("Total instructions executed: 3"));
        assert!(report.contains("Rewrites: 1"));
        assert!(report.contains("66.67%"));
        assert!(report.contains("33.33%"));
    }

    #[test]
    fn test_report_when_disabled() {
        assert!(Profiler::new().report().contains("not enabled"));
    }

    #[test]
    fn test_report_empty() {
        assert!(Profiler::enabled()
            .report()
            .contains("No instructions recorded"));
    }
}
