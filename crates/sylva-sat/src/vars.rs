//! Monotone SAT variable allocation.
//!
//! Every variable id is handed out exactly once over the planner's
//! lifetime. With name printing enabled, each allocation emits a
//! `PVN: <id> <name>` line; ids are printed 1-based to match the DIMACS
//! numbering of the formula dump. Name printing never changes allocation
//! order.

use rustsat::types::Var;
use tracing::info;

/// Allocator of fresh SAT variables.
#[derive(Debug)]
pub struct VarProvider {
    next: u32,
    print_names: bool,
}

impl VarProvider {
    pub fn new(print_names: bool) -> Self {
        VarProvider {
            next: 0,
            print_names,
        }
    }

    /// Allocate a fresh variable.
    pub fn fresh(&mut self) -> Var {
        let var = Var::new(self.next);
        self.next += 1;
        var
    }

    /// Allocate a fresh variable, printing its human-readable name when
    /// name printing is on. The name closure only runs in that case.
    pub fn fresh_named(&mut self, name: impl FnOnce() -> String) -> Var {
        let var = self.fresh();
        if self.print_names {
            info!("PVN: {} {}", var.idx() + 1, name());
        }
        var
    }

    pub fn print_names(&self) -> bool {
        self.print_names
    }

    /// Number of variables allocated so far.
    pub fn num_vars(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_injective_and_dense() {
        let mut vars = VarProvider::new(false);
        let a = vars.fresh();
        let b = vars.fresh_named(|| "b".into());
        let c = vars.fresh();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a.idx() + 1, b.idx());
        assert_eq!(b.idx() + 1, c.idx());
        assert_eq!(vars.num_vars(), 3);
    }
}
