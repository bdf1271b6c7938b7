// the variable set is kept ordered by identifier
use std::collections::BTreeSet;
use std::collections::HashMap;

// we will use a fast hashing algo for maps keyed by variables
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;

use tracing::debug;

use crate::error::{BlockGibbsError, Result};
use crate::factor::{Factor, Variable, VariableId};

pub type VariableHasher = BuildHasherDefault<SeaHasher>;

// ------------- ModelBuilder -------------
/// Collects variables and factors before any index is derived from them.
///
/// Factors are only ever appended. Problems that make the model unusable
/// (a variable without values, or the same identifier registered with two
/// arities) are remembered and surfaced by [`ModelBuilder::build`], so that a
/// graph is never constructed from a malformed model.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    factors: Vec<Factor>,
    variables: BTreeSet<Variable>,
    names: HashMap<VariableId, String, VariableHasher>,
    declared: HashMap<VariableId, u32, VariableHasher>,
    violations: Vec<String>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    /// Records the human readable name of a variable from the model input.
    pub fn name_variable(&mut self, variable: Variable, name: impl Into<String>) {
        self.check_arity(variable);
        self.declared.insert(variable.id(), variable.arity());
        self.names.insert(variable.id(), name.into());
    }
    /// Appends a factor and registers every variable it references. Returns
    /// the identifier (position) of the factor.
    pub fn add_factor(&mut self, factor: Factor) -> usize {
        for variable in factor.domain().vars() {
            self.check_arity(*variable);
            if self.variables.insert(*variable) {
                self.names
                    .entry(variable.id())
                    .or_insert_with(|| format!("x{}", variable.id()));
            }
        }
        self.factors.push(factor);
        self.factors.len() - 1
    }
    // Names read back from a checkpoint; their arity was checked when they
    // were first registered.
    pub(crate) fn restore_name(&mut self, id: VariableId, name: String) {
        self.names.insert(id, name);
    }
    pub fn len(&self) -> usize {
        self.factors.len()
    }
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
    /// Freezes the collected factors and derives the reverse index once.
    pub fn build(self) -> Result<FactorizedModel> {
        if !self.violations.is_empty() {
            return Err(BlockGibbsError::Contract(self.violations.join("; ")));
        }
        let mut var_to_factor: HashMap<Variable, Vec<usize>, VariableHasher> =
            HashMap::default();
        for (factor_id, factor) in self.factors.iter().enumerate() {
            for variable in factor.domain().vars() {
                var_to_factor.entry(*variable).or_default().push(factor_id);
            }
        }
        debug!(
            factors = self.factors.len(),
            variables = self.variables.len(),
            "factorized model built"
        );
        Ok(FactorizedModel {
            factors: self.factors,
            variables: self.variables,
            var_to_factor,
            names: self.names,
        })
    }
    fn check_arity(&mut self, variable: Variable) {
        if variable.arity() == 0 {
            self.violations
                .push(format!("variable {} has no values", variable.id()));
            return;
        }
        let known = self
            .variables
            .get(&variable)
            .map(|v| v.arity())
            .or_else(|| self.declared.get(&variable.id()).copied())
            .filter(|arity| *arity != variable.arity());
        if let Some(arity) = known {
            self.violations.push(format!(
                "variable {} registered with arity {} and {}",
                variable.id(),
                arity,
                variable.arity()
            ));
        }
    }
}

// ------------- FactorizedModel -------------
/// A distribution represented as a collection of log-domain factors.
///
/// The identifier of every variable doubles as the identifier of the vertex
/// that will represent it in the pairwise graph.
#[derive(Debug)]
pub struct FactorizedModel {
    factors: Vec<Factor>,
    variables: BTreeSet<Variable>,
    var_to_factor: HashMap<Variable, Vec<usize>, VariableHasher>,
    names: HashMap<VariableId, String, VariableHasher>,
}

impl FactorizedModel {
    /// In insertion order.
    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }
    /// Ordered by identifier.
    pub fn variables(&self) -> &BTreeSet<Variable> {
        &self.variables
    }
    pub fn factor_ids(&self, variable: &Variable) -> Result<&[usize]> {
        self.var_to_factor
            .get(variable)
            .map(|ids| ids.as_slice())
            .ok_or(BlockGibbsError::NotFound {
                variable: variable.id(),
            })
    }
    pub fn variable(&self, id: VariableId) -> Option<Variable> {
        // identity is the identifier, so the arity of the lookup key is irrelevant
        self.variables.get(&Variable::new(id, 1)).copied()
    }
    pub fn var_name(&self, id: VariableId) -> Option<&str> {
        self.names.get(&id).map(|name| name.as_str())
    }
    /// Every registered name, ordered by identifier.
    pub fn names(&self) -> Vec<(VariableId, &str)> {
        let mut names: Vec<(VariableId, &str)> = self
            .names
            .iter()
            .map(|(id, name)| (*id, name.as_str()))
            .collect();
        names.sort_unstable_by_key(|(id, _)| *id);
        names
    }
    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }
    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::Domain;

    fn pair(a: Variable, b: Variable) -> Factor {
        Factor::new(Domain::new(vec![a, b]).unwrap())
    }

    #[test]
    fn reverse_index_lists_every_referencing_factor() {
        let (a, b, c) = (Variable::new(0, 2), Variable::new(1, 2), Variable::new(2, 2));
        let mut builder = ModelBuilder::new();
        assert_eq!(builder.add_factor(pair(a, b)), 0);
        assert_eq!(builder.add_factor(pair(b, c)), 1);
        let model = builder.build().unwrap();
        assert_eq!(model.factor_ids(&a).unwrap(), &[0]);
        assert_eq!(model.factor_ids(&b).unwrap(), &[0, 1]);
        assert_eq!(model.factor_ids(&c).unwrap(), &[1]);
        let ids: Vec<VariableId> = model.variables().iter().map(|v| v.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn unregistered_variable_is_not_found() {
        let mut builder = ModelBuilder::new();
        builder.add_factor(Factor::new(Domain::unary(Variable::new(0, 2))));
        let model = builder.build().unwrap();
        let err = model.factor_ids(&Variable::new(7, 2)).unwrap_err();
        assert!(matches!(err, BlockGibbsError::NotFound { variable: 7 }));
    }

    #[test]
    fn names_default_to_identifier() {
        let (a, b) = (Variable::new(0, 2), Variable::new(1, 3));
        let mut builder = ModelBuilder::new();
        builder.name_variable(a, "rain");
        builder.add_factor(pair(a, b));
        let model = builder.build().unwrap();
        assert_eq!(model.var_name(0), Some("rain"));
        assert_eq!(model.var_name(1), Some("x1"));
        assert_eq!(model.var_name(2), None);
    }

    #[test]
    fn variable_without_values_fails_the_build() {
        let mut builder = ModelBuilder::new();
        builder.add_factor(pair(Variable::new(0, 2), Variable::new(1, 0)));
        let err = builder.build().unwrap_err();
        assert!(matches!(err, BlockGibbsError::Contract(ref m) if m.contains("variable 1")));

        let mut builder = ModelBuilder::new();
        builder.name_variable(Variable::new(4, 0), "empty");
        assert!(matches!(builder.build(), Err(BlockGibbsError::Contract(_))));
    }

    #[test]
    fn conflicting_arity_fails_the_build() {
        let mut builder = ModelBuilder::new();
        builder.add_factor(Factor::new(Domain::unary(Variable::new(0, 2))));
        builder.add_factor(Factor::new(Domain::unary(Variable::new(0, 3))));
        assert!(matches!(builder.build(), Err(BlockGibbsError::Contract(_))));
    }
}
