//! At-most-one encodings.
//!
//! Small literal sets get the naive pairwise encoding; larger ones use the
//! bimander encoding with roughly √n subgroups, which needs only
//! ⌈log₂ g⌉ auxiliary variables for g groups. Auxiliary variables are
//! allocated before any clause is emitted so variable ids stay dense.

use rustsat::types::{Lit, Var};

use crate::vars::VarProvider;

/// Below this many literals the pairwise encoding is emitted directly.
pub const PAIRWISE_LIMIT: usize = 100;

/// Encode "at most one of `lits`", appending clauses to `sink`.
pub fn at_most_one(lits: &[Lit], vars: &mut VarProvider, sink: &mut Vec<Vec<Lit>>) {
    if lits.len() < PAIRWISE_LIMIT {
        pairwise(lits, sink);
    } else {
        let groups = (lits.len() as f64).sqrt().ceil() as usize;
        BimanderAtMostOne::new(lits, groups, vars).encode(sink);
    }
}

fn pairwise(lits: &[Lit], sink: &mut Vec<Vec<Lit>>) {
    for i in 0..lits.len() {
        for j in i + 1..lits.len() {
            sink.push(vec![!lits[i], !lits[j]]);
        }
    }
}

/// Bimander at-most-one over a fixed set of state literals.
pub struct BimanderAtMostOne {
    states: Vec<Lit>,
    num_groups: usize,
    commander_bits: Vec<Var>,
}

impl BimanderAtMostOne {
    /// Split `lits` into `num_groups` groups and allocate the binary
    /// commander variables up front.
    pub fn new(lits: &[Lit], num_groups: usize, vars: &mut VarProvider) -> Self {
        let num_groups = num_groups.max(1);
        let mut commander_bits = Vec::new();
        let mut representable = 1usize;
        while representable < num_groups {
            let bit_index = commander_bits.len();
            commander_bits.push(vars.fresh_named(|| format!("amo_bit_{bit_index}")));
            representable *= 2;
        }
        BimanderAtMostOne {
            states: lits.to_vec(),
            num_groups,
            commander_bits,
        }
    }

    /// Emit the pairwise-within-group and group-signature clauses.
    pub fn encode(&self, sink: &mut Vec<Vec<Lit>>) {
        let n = self.states.len();
        if n <= 1 {
            return;
        }
        let group_size = n.div_ceil(self.num_groups);

        for g in 0..self.num_groups {
            let start = g * group_size;
            let end = ((g + 1) * group_size).min(n);
            // at most one within the group
            for i in start..end {
                for j in i + 1..end {
                    sink.push(vec![!self.states[i], !self.states[j]]);
                }
            }
            // a true state forces its group's binary signature, so states
            // of two different groups conflict on some bit
            for i in start..end {
                for (bit, &commander) in self.commander_bits.iter().enumerate() {
                    let signature = if g & (1 << bit) != 0 {
                        commander.pos_lit()
                    } else {
                        commander.neg_lit()
                    };
                    sink.push(vec![!self.states[i], signature]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lits(n: usize, vars: &mut VarProvider) -> Vec<Lit> {
        (0..n).map(|_| vars.fresh().pos_lit()).collect()
    }

    /// Every assignment with ≥ 2 true states must violate some clause.
    fn check_is_amo(states: &[Lit], clauses: &[Vec<Lit>], num_vars: u32) {
        let n = num_vars as usize;
        for assignment in 0u32..(1 << n) {
            let value = |lit: Lit| {
                let v = (assignment >> lit.var().idx()) & 1 == 1;
                if lit.is_pos() {
                    v
                } else {
                    !v
                }
            };
            let satisfied = clauses.iter().all(|c| c.iter().any(|&l| value(l)));
            let true_states = states.iter().filter(|&&l| value(l)).count();
            if true_states > 1 {
                assert!(!satisfied, "assignment {assignment:b} defeats the AMO");
            }
        }
    }

    /// For every single-state assignment some commander setting satisfies
    /// all clauses (the encoding must not over-constrain).
    fn check_single_states_allowed(states: &[Lit], clauses: &[Vec<Lit>], num_vars: u32) {
        let n = num_vars as usize;
        for picked in states {
            let found = (0u32..(1 << n)).any(|assignment| {
                let value = |lit: Lit| {
                    let v = (assignment >> lit.var().idx()) & 1 == 1;
                    if lit.is_pos() {
                        v
                    } else {
                        !v
                    }
                };
                states.iter().all(|&s| value(s) == (s == *picked))
                    && clauses.iter().all(|c| c.iter().any(|&l| value(l)))
            });
            assert!(found, "single true state {picked:?} ruled out");
        }
    }

    #[test]
    fn pairwise_small_sets() {
        let mut vars = VarProvider::new(false);
        let states = lits(4, &mut vars);
        let mut clauses = Vec::new();
        at_most_one(&states, &mut vars, &mut clauses);
        // no auxiliaries for the pairwise case
        assert_eq!(vars.num_vars(), 4);
        assert_eq!(clauses.len(), 6);
        check_is_amo(&states, &clauses, vars.num_vars());
        check_single_states_allowed(&states, &clauses, vars.num_vars());
    }

    #[test]
    fn bimander_exhaustive() {
        let mut vars = VarProvider::new(false);
        let states = lits(6, &mut vars);
        let mut clauses = Vec::new();
        BimanderAtMostOne::new(&states, 3, &mut vars).encode(&mut clauses);
        assert_eq!(vars.num_vars(), 8, "⌈log₂ 3⌉ = 2 commander bits");
        check_is_amo(&states, &clauses, vars.num_vars());
        check_single_states_allowed(&states, &clauses, vars.num_vars());
    }

    #[test]
    fn bimander_single_group_degenerates_to_pairwise() {
        let mut vars = VarProvider::new(false);
        let states = lits(3, &mut vars);
        let mut clauses = Vec::new();
        BimanderAtMostOne::new(&states, 1, &mut vars).encode(&mut clauses);
        assert_eq!(vars.num_vars(), 3);
        assert_eq!(clauses.len(), 3);
    }

    #[test]
    fn large_sets_switch_to_bimander() {
        let mut vars = VarProvider::new(false);
        let states = lits(PAIRWISE_LIMIT, &mut vars);
        let mut clauses = Vec::new();
        at_most_one(&states, &mut vars, &mut clauses);
        // pairwise would need n(n-1)/2 = 4950 clauses
        assert!(clauses.len() < 2000);
        assert!(vars.num_vars() > PAIRWISE_LIMIT as u32);
    }
}
