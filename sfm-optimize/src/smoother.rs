use crate::graph::{FactorGraph, FactorSlot, VariableSlot};
use crate::{Factor, Residual, SolverError};
use arrayvec::ArrayVec;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use log::{debug, info, trace};
use sfm_core::nalgebra::{
    dimension::{Dynamic, U1},
    DMatrix, DVector, VecStorage, Vector6,
};
use sfm_core::{Pose3D, Se3TangentSpace, VariableKey, Values};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Step used for the central difference Jacobian.
const JACOBIAN_STEP: f64 = 1e-6;

/// New factors and the initial values of the variables they introduce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphUpdate {
    pub factors: Vec<Factor>,
    pub values: BTreeMap<VariableKey, Pose3D>,
    /// Variables (new or existing) that the solver must hold at their current value.
    pub fixed: BTreeSet<VariableKey>,
}

impl GraphUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_factor(&mut self, factor: Factor) {
        self.factors.push(factor);
    }

    pub fn insert_value(&mut self, key: impl Into<VariableKey>, value: Pose3D) {
        self.values.insert(key.into(), value);
    }

    pub fn fix(&mut self, key: impl Into<VariableKey>) {
        self.fixed.insert(key.into());
    }

    pub fn value(&self, key: VariableKey) -> Option<Pose3D> {
        self.values.get(&key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty() && self.values.is_empty() && self.fixed.is_empty()
    }
}

/// What an update did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpdateReport {
    /// Number of variables that were free to move in the final region.
    pub variables: usize,
    /// Number of factors that were relinearized in the final region.
    pub factors: usize,
    /// Half the squared norm of the whitened residuals over the first region, before the update.
    pub initial_error: f64,
    /// Half the squared norm of the whitened residuals over the final region, after the update.
    pub final_error: f64,
}

/// An optimizer that takes new measurements in batches and keeps the best estimate of every variable.
pub trait IncrementalSolver {
    /// Adds the factors and values of `update` and re-estimates the affected variables.
    ///
    /// On error the solver must be left exactly as it was before the call.
    fn update(&mut self, update: GraphUpdate) -> Result<UpdateReport, SolverError>;

    /// The current estimate of one variable.
    fn value(&self, key: VariableKey) -> Option<Pose3D>;

    /// The current estimate of every variable.
    fn values(&self) -> Values;

    fn contains(&self, key: VariableKey) -> bool {
        self.value(key).is_some()
    }

    /// Number of variables.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The settings for the [`LmSmoother`].
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SmootherSettings {
    /// How many factor hops around the variables touched by new factors the first region reaches.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_relinearize_depth"))]
    pub relinearize_depth: usize,
    /// A variable that moves further than this during an update pulls its neighbors into the
    /// region, which is then optimized again.
    ///
    /// The distance is the norm of the body-frame tangent vector between the old and new value.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_relinearize_threshold")
    )]
    pub relinearize_threshold: f64,
    /// The region stops growing once it holds this many variables. Zero means no limit.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_region_variables")
    )]
    pub max_region_variables: usize,
    /// Every this many updates all free variables are re-optimized. Zero disables it.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_full_relinearize_interval")
    )]
    pub full_relinearize_interval: usize,
    /// Patience handed to Levenberg-Marquardt.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_patience"))]
    pub patience: usize,
}

impl Default for SmootherSettings {
    fn default() -> Self {
        Self {
            relinearize_depth: default_relinearize_depth(),
            relinearize_threshold: default_relinearize_threshold(),
            max_region_variables: default_max_region_variables(),
            full_relinearize_interval: default_full_relinearize_interval(),
            patience: default_patience(),
        }
    }
}

fn default_relinearize_depth() -> usize {
    0
}

fn default_relinearize_threshold() -> f64 {
    0.01
}

fn default_max_region_variables() -> usize {
    64
}

fn default_full_relinearize_interval() -> usize {
    0
}

fn default_patience() -> usize {
    100
}

/// Incremental smoother that runs Levenberg-Marquardt over the part of the graph new factors touch.
///
/// Variables outside the region are held constant while it is optimized. When a variable on the
/// edge of the region moves by more than [`SmootherSettings::relinearize_threshold`], the region
/// grows past it and is optimized again, so a correction travels as far through the graph as it
/// is still felt.
#[derive(Debug, Clone, Default)]
pub struct LmSmoother {
    settings: SmootherSettings,
    graph: FactorGraph,
    updates: usize,
}

impl LmSmoother {
    pub fn new(settings: SmootherSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &SmootherSettings {
        &self.settings
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    /// Checks that every key the update refers to will have a value.
    fn validate(&self, update: &GraphUpdate) -> Result<(), SolverError> {
        if let Some(&key) = update.values.keys().find(|&&key| self.graph.contains(key)) {
            return Err(SolverError::DuplicateVariable(key));
        }
        let known = |key: &VariableKey| self.graph.contains(*key) || update.values.contains_key(key);
        if let Some(&key) = update.fixed.iter().find(|key| !known(key)) {
            return Err(SolverError::UnknownVariable(key));
        }
        for factor in &update.factors {
            if let Some(key) = factor.keys().into_iter().find(|key| !known(key)) {
                return Err(SolverError::UnknownVariable(key));
            }
        }
        Ok(())
    }

    fn rollback(&mut self, inserted: &Inserted) {
        for &slot in inserted.factors.iter().rev() {
            self.graph.remove_factor(slot);
        }
        for &slot in inserted.variables.iter().rev() {
            self.graph.remove_variable(slot);
        }
        for &slot in &inserted.newly_fixed {
            self.graph.set_fixed(slot, false);
        }
    }

    fn insert(&mut self, update: GraphUpdate) -> Result<Inserted, SolverError> {
        let mut inserted = Inserted::default();
        for (&key, &value) in &update.values {
            match self.graph.insert_variable(key, value, false) {
                Ok(slot) => inserted.variables.push(slot),
                Err(e) => {
                    self.rollback(&inserted);
                    return Err(e);
                }
            }
        }
        for key in &update.fixed {
            if let Some(slot) = self.graph.slot(*key) {
                if !self.graph.is_fixed(slot) {
                    self.graph.set_fixed(slot, true);
                    inserted.newly_fixed.push(slot);
                }
            }
        }
        for factor in update.factors {
            match self.graph.insert_factor(factor) {
                Ok(slot) => inserted.factors.push(slot),
                Err(e) => {
                    self.rollback(&inserted);
                    return Err(e);
                }
            }
        }
        Ok(inserted)
    }

    /// The free variables to re-optimize after `inserted` was added.
    fn region(&self, inserted: &Inserted) -> BTreeSet<VariableSlot> {
        let interval = self.settings.full_relinearize_interval;
        if interval != 0 && (self.updates + 1) % interval == 0 {
            debug!("relinearizing every free variable");
            return self
                .graph
                .variable_slots()
                .filter(|&slot| !self.graph.is_fixed(slot))
                .collect();
        }
        let seeds = inserted
            .factors
            .iter()
            .filter_map(|&slot| self.graph.factor(slot))
            .flat_map(|record| record.variables.iter().copied())
            .chain(inserted.variables.iter().copied());
        self.graph
            .neighborhood(seeds, self.settings.relinearize_depth)
    }

    /// Whether `slot` moved further than the threshold from its value in `previous`.
    fn moved(&self, slot: VariableSlot, previous: &BTreeMap<VariableSlot, Pose3D>) -> bool {
        match (previous.get(&slot), self.graph.variable(slot)) {
            (Some(&before), Some(record)) => {
                before.local(record.value).to_vector().norm() > self.settings.relinearize_threshold
            }
            _ => false,
        }
    }

    fn restore(&mut self, previous: &BTreeMap<VariableSlot, Pose3D>) {
        for (&slot, &value) in previous {
            self.graph.set_value(slot, value);
        }
    }

    fn solve(&mut self, inserted: &Inserted) -> Result<UpdateReport, SolverError> {
        let mut region = self.region(inserted);
        let mut previous: BTreeMap<VariableSlot, Pose3D> = region
            .iter()
            .filter_map(|&slot| self.graph.variable(slot).map(|record| (slot, record.value)))
            .collect();
        let mut hops = self.settings.relinearize_depth.max(1);
        let mut report: Option<UpdateReport> = None;
        loop {
            let pass = match self.optimize_region(&region) {
                Ok(Some(pass)) => pass,
                Ok(None) => break,
                Err(e) => {
                    self.restore(&previous);
                    return Err(e);
                }
            };
            report = Some(match report {
                Some(first) => UpdateReport {
                    initial_error: first.initial_error,
                    ..pass
                },
                None => pass,
            });

            let frontier: Vec<VariableSlot> = region
                .iter()
                .copied()
                .filter(|&slot| {
                    self.moved(slot, &previous) && self.graph.reaches_outside(slot, &region)
                })
                .collect();
            if frontier.is_empty() {
                break;
            }
            let limit = self.settings.max_region_variables;
            if limit != 0 && region.len() >= limit {
                debug!(
                    "region of {} variables still moving at its edge, not growing further",
                    region.len()
                );
                break;
            }
            trace!(
                "growing region of {} variables by {} hops around {} moved variables",
                region.len(),
                hops,
                frontier.len()
            );
            for slot in self.graph.neighborhood(frontier, hops) {
                if let Some(record) = self.graph.variable(slot) {
                    previous.entry(slot).or_insert(record.value);
                }
                region.insert(slot);
            }
            hops = hops.saturating_mul(2);
        }
        Ok(report.unwrap_or_default())
    }

    /// Optimizes the free variables of `region` and writes them back into the graph.
    ///
    /// Returns `None` if there is nothing to optimize. Nothing is written on error.
    fn optimize_region(
        &mut self,
        region: &BTreeSet<VariableSlot>,
    ) -> Result<Option<UpdateReport>, SolverError> {
        let factors = self.graph.factors_touching(region);
        if region.is_empty() || factors.is_empty() {
            trace!("nothing to optimize");
            return Ok(None);
        }
        let problem = RegionProblem::new(&self.graph, region.clone(), factors);
        let initial_error = 0.5 * problem.residuals.norm_squared();
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.settings.patience)
            .minimize(problem);
        let usable = report.termination.was_successful()
            || matches!(report.termination, TerminationReason::NoImprovementPossible(_));
        if !usable {
            return Err(SolverError::NotConverged(format!(
                "{:?}",
                report.termination
            )));
        }

        let mut solution = Vec::with_capacity(problem.region.len());
        for (ix, &slot) in problem.region.iter().enumerate() {
            let pose = problem.current(ix);
            if let Some(record) = self.graph.variable(slot) {
                if !pose.is_finite() {
                    return Err(SolverError::NonFinite(record.key));
                }
            }
            solution.push((slot, pose));
        }
        for &slot in &problem.factors {
            let factor = match self.graph.factor(slot) {
                Some(record) => &record.factor,
                None => continue,
            };
            if factor.in_front(|key| problem.lookup(key)) == Some(false) {
                if let Factor::Projection {
                    state, landmark, ..
                } = *factor
                {
                    return Err(SolverError::BehindCamera { state, landmark });
                }
            }
        }

        let update_report = UpdateReport {
            variables: problem.region.len(),
            factors: problem.factors.len(),
            initial_error,
            final_error: report.objective_function,
        };
        for (slot, pose) in solution {
            self.graph.set_value(slot, pose);
        }
        Ok(Some(update_report))
    }
}

/// Records added by one update, kept so the update can be undone.
#[derive(Default)]
struct Inserted {
    variables: Vec<VariableSlot>,
    factors: Vec<FactorSlot>,
    newly_fixed: Vec<VariableSlot>,
}

impl IncrementalSolver for LmSmoother {
    fn update(&mut self, update: GraphUpdate) -> Result<UpdateReport, SolverError> {
        self.validate(&update)?;
        let inserted = self.insert(update)?;
        match self.solve(&inserted) {
            Ok(report) => {
                self.updates += 1;
                info!(
                    "update {} optimized {} variables over {} factors, error {:.6} -> {:.6}",
                    self.updates,
                    report.variables,
                    report.factors,
                    report.initial_error,
                    report.final_error
                );
                Ok(report)
            }
            Err(e) => {
                debug!("rolling back update: {}", e);
                self.rollback(&inserted);
                Err(e)
            }
        }
    }

    fn value(&self, key: VariableKey) -> Option<Pose3D> {
        self.graph.value(key)
    }

    fn values(&self) -> Values {
        self.graph.values()
    }

    fn contains(&self, key: VariableKey) -> bool {
        self.graph.contains(key)
    }

    fn len(&self) -> usize {
        self.graph.num_variables()
    }
}

/// A variable a factor depends on, its value, and its column block if it is free.
type FactorInput = (VariableKey, Pose3D, Option<usize>);

/// Least squares problem over the free variables of one region.
///
/// Each free variable is parametrized by a body-frame perturbation of its value when the problem
/// was built. Everything outside the region is read from the graph and held constant.
#[derive(Clone)]
struct RegionProblem<'a> {
    graph: &'a FactorGraph,
    region: Vec<VariableSlot>,
    columns: HashMap<VariableSlot, usize>,
    base: Vec<Pose3D>,
    factors: Vec<FactorSlot>,
    /// Rows in the residual, padded so there are never fewer rows than parameters.
    rows: usize,
    params: DVector<f64>,
    residuals: DVector<f64>,
}

impl<'a> RegionProblem<'a> {
    fn new(graph: &'a FactorGraph, region: BTreeSet<VariableSlot>, factors: Vec<FactorSlot>) -> Self {
        let region: Vec<VariableSlot> = region.into_iter().collect();
        let columns = region
            .iter()
            .enumerate()
            .map(|(ix, &slot)| (slot, ix))
            .collect();
        let base = region
            .iter()
            .map(|&slot| graph.variable(slot).map_or_else(Pose3D::identity, |r| r.value))
            .collect();
        let factor_rows: usize = factors
            .iter()
            .filter_map(|&slot| graph.factor(slot))
            .map(|record| record.factor.dimension())
            .sum();
        let rows = factor_rows.max(6 * region.len());
        let params = DVector::zeros(6 * region.len());
        let mut problem = Self {
            graph,
            region,
            columns,
            base,
            factors,
            rows,
            params: params.clone(),
            residuals: DVector::zeros(rows),
        };
        problem.set_params(&params);
        problem
    }

    fn tangent(params: &DVector<f64>, ix: usize) -> Vector6<f64> {
        params.fixed_rows::<6>(6 * ix).into_owned()
    }

    fn retract(&self, ix: usize, tangent: &Vector6<f64>) -> Pose3D {
        self.base[ix].retract(Se3TangentSpace::from_vector(tangent))
    }

    /// The value of the variable in column block `ix` under `params`.
    fn value_at(&self, params: &DVector<f64>, ix: usize) -> Pose3D {
        self.retract(ix, &Self::tangent(params, ix))
    }

    fn current(&self, ix: usize) -> Pose3D {
        self.value_at(&self.params, ix)
    }

    fn lookup(&self, key: VariableKey) -> Option<Pose3D> {
        let slot = self.graph.slot(key)?;
        match self.columns.get(&slot) {
            Some(&ix) => Some(self.current(ix)),
            None => self.graph.value(key),
        }
    }

    fn factor_inputs(
        &self,
        factor: &Factor,
        params: &DVector<f64>,
    ) -> Option<ArrayVec<FactorInput, 2>> {
        factor
            .keys()
            .into_iter()
            .map(|key| {
                let slot = self.graph.slot(key)?;
                Some(match self.columns.get(&slot) {
                    Some(&ix) => (key, self.value_at(params, ix), Some(ix)),
                    None => (key, self.graph.variable(slot)?.value, None),
                })
            })
            .collect()
    }

    fn evaluate(factor: &Factor, inputs: &[FactorInput]) -> Option<Residual> {
        factor.whitened_error(|key| {
            inputs
                .iter()
                .find(|&&(input, _, _)| input == key)
                .map(|&(_, value, _)| value)
        })
    }

    fn compute_residuals(&self, params: &DVector<f64>) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(self.rows);
        let mut row = 0;
        for &slot in &self.factors {
            let factor = &self.graph.factor(slot)?.factor;
            let inputs = self.factor_inputs(factor, params)?;
            for e in Self::evaluate(factor, &inputs)? {
                residuals[row] = e;
                row += 1;
            }
        }
        Some(residuals)
    }

    /// Central differences, one factor and one of its free variables at a time.
    fn compute_jacobian(&self, params: &DVector<f64>) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(self.rows, params.len());
        let mut row = 0;
        for &slot in &self.factors {
            let factor = &self.graph.factor(slot)?.factor;
            let mut inputs = self.factor_inputs(factor, params)?;
            for position in 0..inputs.len() {
                let (_, value, block) = inputs[position];
                let block = match block {
                    Some(block) => block,
                    None => continue,
                };
                let tangent = Self::tangent(params, block);
                for j in 0..6 {
                    let mut step = Vector6::zeros();
                    step[j] = JACOBIAN_STEP;
                    inputs[position].1 = self.retract(block, &(tangent + step));
                    let plus = Self::evaluate(factor, &inputs)?;
                    inputs[position].1 = self.retract(block, &(tangent - step));
                    let minus = Self::evaluate(factor, &inputs)?;
                    for (r, (p, m)) in plus.iter().zip(&minus).enumerate() {
                        jacobian[(row + r, 6 * block + j)] = (p - m) / (2.0 * JACOBIAN_STEP);
                    }
                }
                inputs[position].1 = value;
            }
            row += factor.dimension();
        }
        Some(jacobian)
    }
}

impl<'a> LeastSquaresProblem<f64, Dynamic, Dynamic> for RegionProblem<'a> {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
        // A factor without a value cannot happen once the update is validated; NaN makes the
        // minimizer stop if it ever does.
        self.residuals = self
            .compute_residuals(params)
            .unwrap_or_else(|| DVector::from_element(self.rows, f64::NAN));
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals.clone())
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        self.compute_jacobian(&self.params)
    }
}
