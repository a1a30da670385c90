use crate::{Factor, SolverError};
use arrayvec::ArrayVec;
use slotmap::{new_key_type, DenseSlotMap};
use sfm_core::{Pose3D, VariableKey, Values};
use std::collections::{BTreeSet, HashMap, VecDeque};

new_key_type! {
    pub struct VariableSlot;
    pub struct FactorSlot;
}

#[derive(Debug, Clone)]
pub struct VariableRecord {
    pub key: VariableKey,
    pub value: Pose3D,
    /// Fixed variables are never moved by the optimizer.
    pub fixed: bool,
    /// Every factor that depends on this variable.
    pub factors: Vec<FactorSlot>,
}

#[derive(Debug, Clone)]
pub struct FactorRecord {
    pub factor: Factor,
    pub variables: ArrayVec<VariableSlot, 2>,
}

/// Variables and factors stored in arenas, so that slots stay valid while records come and go.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    variables: DenseSlotMap<VariableSlot, VariableRecord>,
    factors: DenseSlotMap<FactorSlot, FactorRecord>,
    index: HashMap<VariableKey, VariableSlot>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, key: VariableKey) -> Option<VariableSlot> {
        self.index.get(&key).copied()
    }

    pub fn variable(&self, slot: VariableSlot) -> Option<&VariableRecord> {
        self.variables.get(slot)
    }

    pub fn factor(&self, slot: FactorSlot) -> Option<&FactorRecord> {
        self.factors.get(slot)
    }

    pub fn value(&self, key: VariableKey) -> Option<Pose3D> {
        self.slot(key)
            .and_then(|slot| self.variables.get(slot))
            .map(|record| record.value)
    }

    pub fn contains(&self, key: VariableKey) -> bool {
        self.index.contains_key(&key)
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn values(&self) -> Values {
        self.variables
            .values()
            .map(|record| (record.key, record.value))
            .collect()
    }

    pub fn variable_slots(&self) -> impl Iterator<Item = VariableSlot> + '_ {
        self.variables.keys()
    }

    pub fn insert_variable(
        &mut self,
        key: VariableKey,
        value: Pose3D,
        fixed: bool,
    ) -> Result<VariableSlot, SolverError> {
        if self.index.contains_key(&key) {
            return Err(SolverError::DuplicateVariable(key));
        }
        let slot = self.variables.insert(VariableRecord {
            key,
            value,
            fixed,
            factors: vec![],
        });
        self.index.insert(key, slot);
        Ok(slot)
    }

    /// Adds a factor whose variables must all exist already.
    pub fn insert_factor(&mut self, factor: Factor) -> Result<FactorSlot, SolverError> {
        let variables = factor
            .keys()
            .into_iter()
            .map(|key| self.slot(key).ok_or(SolverError::UnknownVariable(key)))
            .collect::<Result<ArrayVec<VariableSlot, 2>, _>>()?;
        let slot = self.factors.insert(FactorRecord {
            factor,
            variables: variables.clone(),
        });
        for variable in variables {
            if let Some(record) = self.variables.get_mut(variable) {
                record.factors.push(slot);
            }
        }
        Ok(slot)
    }

    pub fn remove_factor(&mut self, slot: FactorSlot) -> Option<Factor> {
        let record = self.factors.remove(slot)?;
        for variable in &record.variables {
            if let Some(variable) = self.variables.get_mut(*variable) {
                variable.factors.retain(|&f| f != slot);
            }
        }
        Some(record.factor)
    }

    /// Removes a variable. Factors still depending on it are removed too.
    pub fn remove_variable(&mut self, slot: VariableSlot) -> Option<VariableRecord> {
        let factors = self.variables.get(slot)?.factors.clone();
        for factor in factors {
            self.remove_factor(factor);
        }
        let record = self.variables.remove(slot)?;
        self.index.remove(&record.key);
        Some(record)
    }

    pub fn set_value(&mut self, slot: VariableSlot, value: Pose3D) {
        if let Some(record) = self.variables.get_mut(slot) {
            record.value = value;
        }
    }

    pub fn set_fixed(&mut self, slot: VariableSlot, fixed: bool) {
        if let Some(record) = self.variables.get_mut(slot) {
            record.fixed = fixed;
        }
    }

    pub fn is_fixed(&self, slot: VariableSlot) -> bool {
        self.variables.get(slot).map_or(false, |record| record.fixed)
    }

    /// The free variables within `depth` hops of `seeds`, walking through shared factors.
    ///
    /// Fixed variables are neither included nor walked through.
    pub fn neighborhood(
        &self,
        seeds: impl IntoIterator<Item = VariableSlot>,
        depth: usize,
    ) -> BTreeSet<VariableSlot> {
        let mut region = BTreeSet::new();
        let mut queue = VecDeque::new();
        for seed in seeds {
            if !self.is_fixed(seed) && self.variables.contains_key(seed) && region.insert(seed) {
                queue.push_back((seed, 0));
            }
        }
        while let Some((slot, hops)) = queue.pop_front() {
            if hops == depth {
                continue;
            }
            let record = match self.variables.get(slot) {
                Some(record) => record,
                None => continue,
            };
            for factor in record.factors.iter().filter_map(|&f| self.factors.get(f)) {
                for &neighbor in &factor.variables {
                    if !self.is_fixed(neighbor) && region.insert(neighbor) {
                        queue.push_back((neighbor, hops + 1));
                    }
                }
            }
        }
        region
    }

    /// Whether `slot` shares a factor with a free variable that is not in `region`.
    pub fn reaches_outside(&self, slot: VariableSlot, region: &BTreeSet<VariableSlot>) -> bool {
        self.variables.get(slot).map_or(false, |record| {
            record
                .factors
                .iter()
                .filter_map(|&f| self.factors.get(f))
                .flat_map(|factor| factor.variables.iter())
                .any(|&neighbor| !region.contains(&neighbor) && !self.is_fixed(neighbor))
        })
    }

    /// Every factor that depends on at least one variable of `region`, in slot order.
    pub fn factors_touching(&self, region: &BTreeSet<VariableSlot>) -> Vec<FactorSlot> {
        let touching: BTreeSet<FactorSlot> = region
            .iter()
            .filter_map(|&slot| self.variables.get(slot))
            .flat_map(|record| record.factors.iter().copied())
            .collect();
        touching.into_iter().collect()
    }
}
