// custom made ordering and identity for variables
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

// used to print out readable forms of the model
use std::fmt;

// used when drawing initial assignments
use rand::Rng;

use crate::error::{BlockGibbsError, Result};

// ------------- Variable -------------
pub type VariableId = u32;

/// Upper bound on the number of variables a single factor may span.
pub const MAX_DIM: usize = 10;

#[derive(Debug, Clone, Copy, Eq)]
pub struct Variable {
    id: VariableId,
    arity: u32,
}

impl Variable {
    /// A variable needs at least one value; [`crate::model::ModelBuilder`]
    /// refuses to build a model referencing one with arity 0.
    pub fn new(id: VariableId, arity: u32) -> Self {
        Self { id, arity }
    }
    // Getters only, so that a variable is truly immutable after creation.
    pub fn id(&self) -> VariableId {
        self.id
    }
    pub fn arity(&self) -> u32 {
        self.arity
    }
}
// Identity is the identifier alone.
impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl Ord for Variable {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}
impl PartialOrd for Variable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "x{}:{}", self.id, self.arity)
    }
}

// ------------- Domain -------------
/// Ordered (by identifier), duplicate free set of variables spanning a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Domain {
    vars: Vec<Variable>,
}

impl Domain {
    pub fn new<I: IntoIterator<Item = Variable>>(vars: I) -> Result<Self> {
        let mut vars: Vec<Variable> = vars.into_iter().collect();
        vars.sort_unstable();
        if let Some(clash) = vars
            .windows(2)
            .find(|w| w[0] == w[1] && w[0].arity != w[1].arity)
        {
            return Err(BlockGibbsError::Contract(format!(
                "variable {} appears with arities {} and {}",
                clash[0].id, clash[0].arity, clash[1].arity
            )));
        }
        vars.dedup();
        if vars.is_empty() {
            return Err(BlockGibbsError::Contract(
                "a domain must contain at least one variable".into(),
            ));
        }
        if vars.len() > MAX_DIM {
            return Err(BlockGibbsError::Contract(format!(
                "a domain spans {} variables, at most {} are supported",
                vars.len(),
                MAX_DIM
            )));
        }
        Ok(Self { vars })
    }
    pub fn unary(variable: Variable) -> Self {
        Self {
            vars: vec![variable],
        }
    }
    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }
    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }
    pub fn var(&self, i: usize) -> Variable {
        self.vars[i]
    }
    /// Number of cells in a table over this domain.
    pub fn size(&self) -> usize {
        self.vars.iter().map(|v| v.arity as usize).product()
    }
    pub fn index_of(&self, variable: &Variable) -> Option<usize> {
        self.vars.binary_search(variable).ok()
    }
    pub fn contains(&self, variable: &Variable) -> bool {
        self.index_of(variable).is_some()
    }
    pub fn is_subset_of(&self, other: &Domain) -> bool {
        self.vars
            .iter()
            .all(|v| other.index_of(v).is_some_and(|i| other.vars[i].arity == v.arity))
    }
    /// Identifiers and arities agree (plain equality only compares identifiers).
    pub fn same_shape(&self, other: &Domain) -> bool {
        self.vars.len() == other.vars.len()
            && self
                .vars
                .iter()
                .zip(other.vars.iter())
                .all(|(a, b)| a.id == b.id && a.arity == b.arity)
    }
    // Row-major: the last variable varies fastest.
    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.vars.len()];
        for i in (0..self.vars.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.vars[i + 1].arity as usize;
        }
        strides
    }
    // For every axis of self, the stride of the same variable in `sub`, or 0
    // when `sub` does not contain it.
    fn projection_strides(&self, sub: &Domain) -> Vec<usize> {
        let sub_strides = sub.strides();
        self.vars
            .iter()
            .map(|v| sub.index_of(v).map_or(0, |i| sub_strides[i]))
            .collect()
    }
}
impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let vars: Vec<String> = self.vars.iter().map(|v| v.to_string()).collect();
        write!(f, "{{{}}}", vars.join(", "))
    }
}

// ------------- Assignment -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    domain: Domain,
    values: Vec<u32>,
}

impl Assignment {
    /// Every variable at its first value.
    pub fn new(domain: Domain) -> Self {
        let values = vec![0; domain.num_vars()];
        Self { domain, values }
    }
    pub fn from_values(domain: Domain, values: Vec<u32>) -> Result<Self> {
        if values.len() != domain.num_vars() {
            return Err(BlockGibbsError::Contract(format!(
                "{} values given for a domain of {} variables",
                values.len(),
                domain.num_vars()
            )));
        }
        if let Some((var, value)) = domain
            .vars()
            .iter()
            .zip(values.iter())
            .find(|(var, value)| **value >= var.arity)
        {
            return Err(BlockGibbsError::Contract(format!(
                "value {value} is out of range for {var}"
            )));
        }
        Ok(Self { domain, values })
    }
    pub fn from_linear_index(domain: Domain, index: usize) -> Result<Self> {
        if index >= domain.size() {
            return Err(BlockGibbsError::Contract(format!(
                "linear index {index} is out of range for {domain}"
            )));
        }
        let mut values = vec![0; domain.num_vars()];
        let mut rest = index;
        for i in (0..domain.num_vars()).rev() {
            let arity = domain.vars[i].arity as usize;
            values[i] = (rest % arity) as u32;
            rest /= arity;
        }
        Ok(Self { domain, values })
    }
    pub fn domain(&self) -> &Domain {
        &self.domain
    }
    pub fn values(&self) -> &[u32] {
        &self.values
    }
    pub fn value(&self, variable: &Variable) -> Option<u32> {
        self.domain.index_of(variable).map(|i| self.values[i])
    }
    pub fn set(&mut self, variable: &Variable, value: u32) -> Result<()> {
        let i = self.domain.index_of(variable).ok_or_else(|| {
            BlockGibbsError::Contract(format!("{variable} is not part of {}", self.domain))
        })?;
        if value >= self.domain.vars[i].arity {
            return Err(BlockGibbsError::Contract(format!(
                "value {value} is out of range for {variable}"
            )));
        }
        self.values[i] = value;
        Ok(())
    }
    pub fn linear_index(&self) -> usize {
        self.domain
            .vars
            .iter()
            .zip(self.values.iter())
            .fold(0, |index, (var, value)| {
                index * var.arity as usize + *value as usize
            })
    }
    pub fn uniform_sample<R: Rng>(&mut self, rng: &mut R) {
        for (var, value) in self.domain.vars.iter().zip(self.values.iter_mut()) {
            *value = rng.gen_range(0..var.arity);
        }
    }
}

// ------------- Factor -------------
/// Dense table over a domain, stored as log probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    domain: Domain,
    logp: Vec<f64>,
}

impl Factor {
    /// A factor with every entry at log(1) = 0.
    pub fn new(domain: Domain) -> Self {
        let logp = vec![0.0; domain.size()];
        Self { domain, logp }
    }
    pub fn from_table(domain: Domain, logp: Vec<f64>) -> Result<Self> {
        if logp.len() != domain.size() {
            return Err(BlockGibbsError::Contract(format!(
                "table has {} entries but {} needs {}",
                logp.len(),
                domain,
                domain.size()
            )));
        }
        Ok(Self { domain, logp })
    }
    pub fn domain(&self) -> &Domain {
        &self.domain
    }
    pub fn num_vars(&self) -> usize {
        self.domain.num_vars()
    }
    pub fn size(&self) -> usize {
        self.logp.len()
    }
    pub fn table(&self) -> &[f64] {
        &self.logp
    }
    pub fn uniform(&mut self, value: f64) {
        self.logp.iter_mut().for_each(|x| *x = value);
    }
    pub fn logp(&self, assignment: &Assignment) -> f64 {
        debug_assert!(assignment.domain().same_shape(&self.domain));
        self.logp[assignment.linear_index()]
    }
    pub fn set_logp(&mut self, assignment: &Assignment, value: f64) {
        debug_assert!(assignment.domain().same_shape(&self.domain));
        self.logp[assignment.linear_index()] = value;
    }
    pub fn logp_index(&self, index: usize) -> f64 {
        self.logp[index]
    }
    pub fn set_logp_index(&mut self, index: usize, value: f64) {
        self.logp[index] = value;
    }
    pub fn log_sum_exp(&self) -> f64 {
        log_sum_exp(&self.logp)
    }
    /// Shifts the table so that it sums to one. A table without any finite
    /// mass is left as it is.
    pub fn normalize(&mut self) {
        let z = self.log_sum_exp();
        if z.is_finite() {
            self.logp.iter_mut().for_each(|x| *x -= z);
        }
    }
    /// Sums out (in log space) every variable that is not part of `sub`.
    pub fn marginalize(&self, sub: &Domain) -> Result<Factor> {
        if !sub.is_subset_of(&self.domain) {
            return Err(BlockGibbsError::Contract(format!(
                "cannot marginalize {} onto {}",
                self.domain, sub
            )));
        }
        let strides = self.domain.projection_strides(sub);
        let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); sub.size()];
        self.for_each_projection(&strides, |index, target| {
            buckets[target].push(self.logp[index]);
        });
        let logp = buckets.iter().map(|b| log_sum_exp(b)).collect();
        Ok(Factor {
            domain: sub.clone(),
            logp,
        })
    }
    /// Log-space product with a factor over a subset of this domain.
    pub fn multiply_in(&mut self, other: &Factor) -> Result<()> {
        if !other.domain.is_subset_of(&self.domain) {
            return Err(BlockGibbsError::Contract(format!(
                "cannot multiply {} into {}",
                other.domain, self.domain
            )));
        }
        let strides = self.domain.projection_strides(&other.domain);
        let mut updates = Vec::with_capacity(self.logp.len());
        self.for_each_projection(&strides, |index, source| {
            updates.push((index, other.logp[source]));
        });
        for (index, value) in updates {
            self.logp[index] += value;
        }
        Ok(())
    }
    // Walks every cell in linear order together with its projected index.
    fn for_each_projection<F: FnMut(usize, usize)>(&self, strides: &[usize], mut visit: F) {
        let vars = self.domain.vars();
        let mut values = vec![0u32; vars.len()];
        let mut projected = 0usize;
        for index in 0..self.logp.len() {
            visit(index, projected);
            // odometer increment, last axis fastest
            for axis in (0..vars.len()).rev() {
                values[axis] += 1;
                projected += strides[axis];
                if values[axis] < vars[axis].arity {
                    break;
                }
                projected -= strides[axis] * values[axis] as usize;
                values[axis] = 0;
            }
        }
    }
}
impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let cells: Vec<String> = self.logp.iter().map(|x| format!("{x:.4}")).collect();
        write!(f, "{} [{}]", self.domain, cells.join(", "))
    }
}

pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> (Variable, Variable, Variable) {
        (Variable::new(0, 2), Variable::new(1, 3), Variable::new(2, 2))
    }

    #[test]
    fn domain_is_sorted_and_deduplicated() {
        let (a, b, c) = abc();
        let domain = Domain::new(vec![c, a, b, a]).unwrap();
        assert_eq!(domain.vars(), &[a, b, c]);
        assert_eq!(domain.size(), 12);
    }

    #[test]
    fn domain_rejects_empty_and_oversized() {
        assert!(matches!(
            Domain::new(Vec::new()),
            Err(BlockGibbsError::Contract(_))
        ));
        let many = (0..(MAX_DIM as u32 + 1)).map(|i| Variable::new(i, 2));
        assert!(Domain::new(many).is_err());
    }

    #[test]
    fn domain_rejects_conflicting_arity() {
        let err = Domain::new(vec![Variable::new(3, 2), Variable::new(3, 4)]).unwrap_err();
        assert!(err.to_string().contains("arities"));
    }

    #[test]
    fn linear_index_is_row_major() {
        let (a, b, _) = abc();
        let domain = Domain::new(vec![a, b]).unwrap();
        let asg = Assignment::from_values(domain.clone(), vec![1, 2]).unwrap();
        assert_eq!(asg.linear_index(), 5);
        for index in 0..domain.size() {
            let asg = Assignment::from_linear_index(domain.clone(), index).unwrap();
            assert_eq!(asg.linear_index(), index);
        }
        let asg = Assignment::from_linear_index(domain, 1).unwrap();
        assert_eq!(asg.values(), &[0, 1]);
    }

    #[test]
    fn assignment_rejects_out_of_range_values() {
        let (a, _, _) = abc();
        assert!(Assignment::from_values(Domain::unary(a), vec![2]).is_err());
        let mut asg = Assignment::new(Domain::unary(a));
        assert!(asg.set(&a, 5).is_err());
        asg.set(&a, 1).unwrap();
        assert_eq!(asg.value(&a), Some(1));
    }

    #[test]
    fn normalize_subtracts_log_partition() {
        let (a, _, _) = abc();
        let mut f = Factor::from_table(Domain::unary(a), vec![0.0, 2f64.ln()]).unwrap();
        f.normalize();
        assert!((f.logp_index(0).exp() - 1.0 / 3.0).abs() < 1e-12);
        assert!((f.logp_index(1).exp() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn normalize_handles_minimum_log_probability_tables() {
        let (a, _, _) = abc();
        let mut f = Factor::new(Domain::unary(a));
        f.uniform(-f64::MAX);
        f.normalize();
        assert!((f.logp_index(0) + 2f64.ln()).abs() < 1e-12);
        let mut empty = Factor::new(Domain::unary(a));
        empty.uniform(f64::NEG_INFINITY);
        empty.normalize();
        assert_eq!(empty.logp_index(0), f64::NEG_INFINITY);
    }

    #[test]
    fn marginalize_sums_out_dropped_axes() {
        let (a, b, _) = abc();
        let domain = Domain::new(vec![a, b]).unwrap();
        let table = (0..6).map(|i| (i as f64 + 1.0).ln()).collect();
        let f = Factor::from_table(domain, table).unwrap();
        let on_a = f.marginalize(&Domain::unary(a)).unwrap();
        assert!((on_a.logp_index(0).exp() - 6.0).abs() < 1e-9);
        assert!((on_a.logp_index(1).exp() - 15.0).abs() < 1e-9);
        let on_b = f.marginalize(&Domain::unary(b)).unwrap();
        assert!((on_b.logp_index(2).exp() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn multiply_in_broadcasts_over_missing_axes() {
        let (a, b, _) = abc();
        let mut joint = Factor::new(Domain::new(vec![a, b]).unwrap());
        let unary = Factor::from_table(Domain::unary(b), vec![1.0, 2.0, 3.0]).unwrap();
        joint.multiply_in(&unary).unwrap();
        assert_eq!(joint.table(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        assert!(unary.clone().multiply_in(&joint).is_err());
    }
}
