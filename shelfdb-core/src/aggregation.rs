// src/aggregation.rs
// Aggregation pipeline implementation

use std::cmp::Ordering;

use ahash::AHashMap;
use serde_json::{Map, Value};

use crate::document::{resolve_path, ID_FIELD};
use crate::error::{Result, ShelfError};
use crate::expression::Expr;
use crate::find_options::{apply_sort, insert_path, parse_sort, remove_path};
use crate::index::{compare_values, IndexKey, SortDirection};
use crate::query::Query;

/// Aggregation pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(MatchStage),
    Project(ProjectStage),
    Group(GroupStage),
    Sort(SortStage),
    Limit(LimitStage),
    Skip(SkipStage),
}

/// $match stage - filter documents
#[derive(Debug, Clone)]
pub struct MatchStage {
    query: Query,
}

/// $project stage - reshape documents
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
    include_mode: bool,
    exclude_id: bool,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Expr),
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone)]
pub struct GroupStage {
    id: Expr,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    First(Expr),
    Last(Expr),
    Count,
}

/// Running state of one accumulator within one group
#[derive(Debug, Clone)]
enum AccumulatorState {
    Sum { int: i64, float: f64, has_float: bool },
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Count(u64),
}

/// $sort stage - sort documents
#[derive(Debug, Clone)]
pub struct SortStage {
    fields: Vec<(String, SortDirection)>,
}

/// $limit stage - limit number of documents
#[derive(Debug, Clone)]
pub struct LimitStage {
    limit: usize,
}

/// $skip stage - skip documents
#[derive(Debug, Clone)]
pub struct SkipStage {
    skip: usize,
}

impl Pipeline {
    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &Value) -> Result<Self> {
        if let Value::Array(stages_array) = pipeline_json {
            if stages_array.is_empty() {
                return Err(ShelfError::AggregationError("Pipeline cannot be empty".to_string()));
            }

            let stages = stages_array
                .iter()
                .map(Stage::from_json)
                .collect::<Result<Vec<_>>>()?;

            Ok(Pipeline { stages })
        } else {
            Err(ShelfError::AggregationError("Pipeline must be an array".to_string()))
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Filter of a leading `$match`, which the caller may answer with an index
    pub fn leading_match(&self) -> Option<&Query> {
        match self.stages.first() {
            Some(Stage::Match(stage)) => Some(&stage.query),
            _ => None,
        }
    }

    /// Execute pipeline on documents
    pub fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        Self::run(&self.stages, docs)
    }

    /// Execute everything after the leading `$match`; `docs` must already satisfy it
    pub fn execute_after_match(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let rest = match self.stages.first() {
            Some(Stage::Match(_)) => &self.stages[1..],
            _ => &self.stages[..],
        };
        Self::run(rest, docs)
    }

    fn run(stages: &[Stage], mut docs: Vec<Value>) -> Result<Vec<Value>> {
        for stage in stages {
            docs = stage.execute(docs)?;
        }
        Ok(docs)
    }
}

impl Stage {
    /// Parse stage from JSON
    fn from_json(stage_json: &Value) -> Result<Self> {
        let obj = match stage_json {
            Value::Object(obj) if obj.len() == 1 => obj,
            Value::Object(_) => {
                return Err(ShelfError::AggregationError(
                    "Each stage must have exactly one operator".to_string(),
                ));
            }
            _ => return Err(ShelfError::AggregationError("Stage must be an object".to_string())),
        };

        let Some((stage_name, stage_spec)) = obj.iter().next() else {
            return Err(ShelfError::AggregationError("Stage must be an object".to_string()));
        };

        match stage_name.as_str() {
            "$match" => Ok(Stage::Match(MatchStage::from_json(stage_spec)?)),
            "$project" => Ok(Stage::Project(ProjectStage::from_json(stage_spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(stage_spec)?)),
            "$sort" => Ok(Stage::Sort(SortStage::from_json(stage_spec)?)),
            "$limit" => Ok(Stage::Limit(LimitStage::from_json(stage_spec)?)),
            "$skip" => Ok(Stage::Skip(SkipStage::from_json(stage_spec)?)),
            _ => Err(ShelfError::AggregationError(format!(
                "Unknown pipeline stage: {}",
                stage_name
            ))),
        }
    }

    /// Execute this stage
    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        match self {
            Stage::Match(stage) => stage.execute(docs),
            Stage::Project(stage) => stage.execute(docs),
            Stage::Group(stage) => stage.execute(docs),
            Stage::Sort(stage) => stage.execute(docs),
            Stage::Limit(stage) => stage.execute(docs),
            Stage::Skip(stage) => stage.execute(docs),
        }
    }
}

impl MatchStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let query = Query::from_json(spec)?;
        Ok(MatchStage { query })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        Ok(docs.into_iter().filter(|doc| self.query.matches(doc)).collect())
    }
}

impl ProjectStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| ShelfError::AggregationError("$project must be an object".to_string()))?;
        if obj.is_empty() {
            return Err(ShelfError::AggregationError("$project requires at least one field".to_string()));
        }

        let mut fields = Vec::with_capacity(obj.len());
        let mut exclude_id = false;
        for (field, value) in obj {
            let project_field = match value {
                Value::Bool(b) => Self::flag(*b),
                Value::Number(n) => Self::flag(n.as_f64() != Some(0.0)),
                other => ProjectField::Computed(Expr::from_json(other)?),
            };

            if field == ID_FIELD {
                if let ProjectField::Exclude = project_field {
                    exclude_id = true;
                    continue;
                }
            }
            fields.push((field.clone(), project_field));
        }

        let includes = fields.iter().any(|(_, p)| !matches!(p, ProjectField::Exclude));
        let excludes = fields.iter().any(|(_, p)| matches!(p, ProjectField::Exclude));
        if includes && excludes {
            return Err(ShelfError::AggregationError(
                "$project cannot mix inclusion and exclusion".to_string(),
            ));
        }

        Ok(ProjectStage {
            include_mode: includes,
            fields,
            exclude_id,
        })
    }

    fn flag(include: bool) -> ProjectField {
        if include {
            ProjectField::Include
        } else {
            ProjectField::Exclude
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        docs.iter().map(|doc| self.project_document(doc)).collect()
    }

    fn project_document(&self, doc: &Value) -> Result<Value> {
        let Value::Object(obj) = doc else {
            return Ok(doc.clone());
        };

        if !self.include_mode {
            let mut result = obj.clone();
            for (field, _) in self.fields.iter().filter(|(_, p)| matches!(p, ProjectField::Exclude)) {
                remove_path(&mut result, field);
            }
            if self.exclude_id {
                result.remove(ID_FIELD);
            }
            return Ok(Value::Object(result));
        }

        let mut result = Map::new();
        if !self.exclude_id {
            if let Some(id) = obj.get(ID_FIELD) {
                result.insert(ID_FIELD.to_string(), id.clone());
            }
        }
        for (field, action) in &self.fields {
            match action {
                ProjectField::Include => {
                    if let Some(value) = resolve_path(doc, field) {
                        insert_path(&mut result, field, value.clone());
                    }
                }
                ProjectField::Computed(expr) => {
                    insert_path(&mut result, field, expr.eval(doc)?);
                }
                ProjectField::Exclude => {}
            }
        }
        Ok(Value::Object(result))
    }
}

impl GroupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| ShelfError::AggregationError("$group must be an object".to_string()))?;

        let id = obj
            .get(ID_FIELD)
            .map(Expr::from_json)
            .transpose()?
            .ok_or_else(|| ShelfError::AggregationError("Group stage must have _id field".to_string()))?;

        let mut accumulators = Vec::with_capacity(obj.len().saturating_sub(1));
        for (field, value) in obj {
            if field == ID_FIELD {
                continue;
            }
            if field.contains('.') || field.starts_with('$') {
                return Err(ShelfError::AggregationError(format!(
                    "Invalid group output field: {}",
                    field
                )));
            }
            accumulators.push((field.clone(), Accumulator::from_json(value)?));
        }

        Ok(GroupStage { id, accumulators })
    }

    /// One output document per distinct key, in the order keys are first seen
    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut positions: AHashMap<IndexKey, usize> = AHashMap::new();
        let mut groups: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();

        for doc in &docs {
            let key = self.id.eval(doc)?;
            let slot = match positions.get(&IndexKey::from(&key)) {
                Some(&slot) => slot,
                None => {
                    positions.insert(IndexKey::from(&key), groups.len());
                    let states = self.accumulators.iter().map(|(_, acc)| acc.initial_state()).collect();
                    groups.push((key, states));
                    groups.len() - 1
                }
            };

            let states = &mut groups[slot].1;
            for ((_, accumulator), state) in self.accumulators.iter().zip(states.iter_mut()) {
                accumulator.accumulate(state, doc)?;
            }
        }

        Ok(groups
            .into_iter()
            .map(|(key, states)| {
                let mut result = Map::new();
                result.insert(ID_FIELD.to_string(), key);
                for ((field, _), state) in self.accumulators.iter().zip(states) {
                    result.insert(field.clone(), state.finish());
                }
                Value::Object(result)
            })
            .collect())
    }
}

impl Accumulator {
    fn from_json(spec: &Value) -> Result<Self> {
        let entry = match spec {
            Value::Object(obj) if obj.len() == 1 => obj.iter().next(),
            _ => None,
        };
        let Some((op, value)) = entry else {
            return Err(ShelfError::AggregationError(
                "Accumulator must be an object with exactly one operator".to_string(),
            ));
        };

        match op.as_str() {
            "$count" => match value {
                Value::Object(args) if args.is_empty() => Ok(Accumulator::Count),
                _ => Err(ShelfError::AggregationError("$count takes an empty object".to_string())),
            },
            "$sum" => Ok(Accumulator::Sum(Expr::from_json(value)?)),
            "$avg" => Ok(Accumulator::Avg(Expr::from_json(value)?)),
            "$min" => Ok(Accumulator::Min(Expr::from_json(value)?)),
            "$max" => Ok(Accumulator::Max(Expr::from_json(value)?)),
            "$first" => Ok(Accumulator::First(Expr::from_json(value)?)),
            "$last" => Ok(Accumulator::Last(Expr::from_json(value)?)),
            _ => Err(ShelfError::AggregationError(format!("Unknown accumulator: {}", op))),
        }
    }

    fn initial_state(&self) -> AccumulatorState {
        match self {
            Accumulator::Sum(_) => AccumulatorState::Sum { int: 0, float: 0.0, has_float: false },
            Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
            Accumulator::Min(_) => AccumulatorState::Min(None),
            Accumulator::Max(_) => AccumulatorState::Max(None),
            Accumulator::First(_) => AccumulatorState::First(None),
            Accumulator::Last(_) => AccumulatorState::Last(Value::Null),
            Accumulator::Count => AccumulatorState::Count(0),
        }
    }

    /// Fold one document into the running state. Non-numeric values are
    /// ignored by `$sum`/`$avg`, nulls by `$min`/`$max`.
    fn accumulate(&self, state: &mut AccumulatorState, doc: &Value) -> Result<()> {
        match (self, state) {
            (Accumulator::Count, AccumulatorState::Count(n)) => *n += 1,
            (Accumulator::Sum(expr), AccumulatorState::Sum { int, float, has_float }) => {
                if let Value::Number(n) = expr.eval(doc)? {
                    match n.as_i64().and_then(|i| int.checked_add(i)) {
                        Some(total) if !*has_float => *int = total,
                        _ => {
                            *float += n.as_f64().unwrap_or(0.0);
                            *has_float = true;
                        }
                    }
                }
            }
            (Accumulator::Avg(expr), AccumulatorState::Avg { sum, count }) => {
                if let Value::Number(n) = expr.eval(doc)? {
                    *sum += n.as_f64().unwrap_or(0.0);
                    *count += 1;
                }
            }
            (Accumulator::Min(expr), AccumulatorState::Min(current)) => {
                Self::keep_extreme(current, expr.eval(doc)?, Ordering::Less);
            }
            (Accumulator::Max(expr), AccumulatorState::Max(current)) => {
                Self::keep_extreme(current, expr.eval(doc)?, Ordering::Greater);
            }
            (Accumulator::First(expr), AccumulatorState::First(current)) => {
                if current.is_none() {
                    *current = Some(expr.eval(doc)?);
                }
            }
            (Accumulator::Last(expr), AccumulatorState::Last(current)) => {
                *current = expr.eval(doc)?;
            }
            _ => {
                return Err(ShelfError::AggregationError(
                    "accumulator state does not match accumulator".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn keep_extreme(current: &mut Option<Value>, candidate: Value, wanted: Ordering) {
        if candidate.is_null() {
            return;
        }
        let replace = match current {
            Some(existing) => compare_values(Some(&candidate), Some(existing)) == wanted,
            None => true,
        };
        if replace {
            *current = Some(candidate);
        }
    }
}

impl AccumulatorState {
    fn finish(self) -> Value {
        match self {
            AccumulatorState::Sum { int, float, has_float } => {
                if has_float {
                    Value::from(float + int as f64)
                } else {
                    Value::from(int)
                }
            }
            AccumulatorState::Avg { sum, count } => {
                if count > 0 {
                    Value::from(sum / count as f64)
                } else {
                    Value::Null
                }
            }
            AccumulatorState::Min(v) | AccumulatorState::Max(v) | AccumulatorState::First(v) => {
                v.unwrap_or(Value::Null)
            }
            AccumulatorState::Last(v) => v,
            AccumulatorState::Count(n) => Value::from(n),
        }
    }
}

impl SortStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let fields = parse_sort(spec).map_err(|e| ShelfError::AggregationError(format!("$sort: {}", e)))?;
        if fields.is_empty() {
            return Err(ShelfError::AggregationError("$sort requires at least one field".to_string()));
        }
        Ok(SortStage { fields })
    }

    fn execute(&self, mut docs: Vec<Value>) -> Result<Vec<Value>> {
        apply_sort(&mut docs, &self.fields);
        Ok(docs)
    }
}

impl LimitStage {
    fn from_json(spec: &Value) -> Result<Self> {
        match spec.as_u64() {
            Some(n) if n > 0 => Ok(LimitStage { limit: n as usize }),
            _ => Err(ShelfError::AggregationError("$limit must be a positive integer".to_string())),
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        Ok(docs.into_iter().take(self.limit).collect())
    }
}

impl SkipStage {
    fn from_json(spec: &Value) -> Result<Self> {
        if let Some(n) = spec.as_u64() {
            Ok(SkipStage { skip: n as usize })
        } else {
            Err(ShelfError::AggregationError("$skip must be a non-negative integer".to_string()))
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        Ok(docs.into_iter().skip(self.skip).collect())
    }
}
