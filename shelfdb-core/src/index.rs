// src/index.rs
// Ordered secondary indexes over one or more document fields

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::ops::Bound;

use serde::{Serialize, Deserialize};
use serde_json::{Number, Value};

use crate::document::Document;
use crate::error::{Result, ShelfError};

/// Index key - one canonical, totally ordered form of a JSON value.
///
/// Variant order is the value order used everywhere (sort, range
/// comparison, min/max): null < numbers < strings < objects < arrays < bools.
/// Missing fields are indexed as `Null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Number(NumberKey),
    String(String),
    Object(String),
    Array(String),
    Bool(bool),
}

/// OrderedFloat wrapper for f64 to enable Ord
///
/// `-0.0` is folded into `0.0` and every NaN into one canonical NaN so that
/// bitwise equality agrees with the ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl OrderedFloat {
    pub fn new(value: f64) -> Self {
        if value == 0.0 {
            OrderedFloat(0.0)
        } else if value.is_nan() {
            OrderedFloat(f64::NAN)
        } else {
            OrderedFloat(value)
        }
    }
}

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedFloat {}

impl Hash for OrderedFloat {
    fn hash<H: Hasher>(&self, state: &mut H) {
        OrderedFloat::new(self.0).0.to_bits().hash(state);
    }
}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal),
        }
    }
}

/// 2^127: integral floats below this magnitude are keyed as integers
const I128_BOUND: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;

/// Exact numeric key. Integers and integral floats are keyed as `Int`, so
/// `15 == 15.0` while integers past 2^53 stay distinct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum NumberKey {
    Int(i128),
    Float(OrderedFloat),
}

impl NumberKey {
    pub fn from_f64(value: f64) -> Self {
        if value.fract() == 0.0 && (-I128_BOUND..I128_BOUND).contains(&value) {
            NumberKey::Int(value as i128)
        } else {
            NumberKey::Float(OrderedFloat::new(value))
        }
    }

    pub fn from_number(n: &Number) -> Self {
        if let Some(i) = n.as_i64() {
            NumberKey::Int(i128::from(i))
        } else if let Some(u) = n.as_u64() {
            NumberKey::Int(i128::from(u))
        } else {
            Self::from_f64(n.as_f64().unwrap_or(f64::NAN))
        }
    }

    fn canonical(self) -> Self {
        match self {
            NumberKey::Float(f) => Self::from_f64(f.0),
            int => int,
        }
    }
}

/// Exact ordering of an integer against a float; NaN sorts last
fn cmp_int_float(i: i128, f: f64) -> Ordering {
    if f.is_nan() || f >= I128_BOUND {
        Ordering::Less
    } else if f < -I128_BOUND {
        Ordering::Greater
    } else if f.fract() == 0.0 {
        i.cmp(&(f as i128))
    } else if i <= f.floor() as i128 {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

impl Ord for NumberKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (NumberKey::Int(a), NumberKey::Int(b)) => a.cmp(b),
            (NumberKey::Float(a), NumberKey::Float(b)) => a.cmp(b),
            (NumberKey::Int(a), NumberKey::Float(b)) => cmp_int_float(*a, b.0),
            (NumberKey::Float(a), NumberKey::Int(b)) => cmp_int_float(*b, a.0).reverse(),
        }
    }
}

impl PartialOrd for NumberKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for NumberKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NumberKey {}

impl Hash for NumberKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.canonical() {
            NumberKey::Int(i) => (0u8, i).hash(state),
            NumberKey::Float(f) => (1u8, f).hash(state),
        }
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => IndexKey::Number(NumberKey::from_number(n)),
            Value::String(s) => IndexKey::String(s.clone()),
            Value::Object(_) => IndexKey::Object(value.to_string()),
            Value::Array(_) => IndexKey::Array(value.to_string()),
        }
    }
}

impl IndexKey {
    /// Key for a possibly missing field
    pub fn from_option(value: Option<&Value>) -> Self {
        value.map(IndexKey::from).unwrap_or(IndexKey::Null)
    }

    /// Smallest key of a type bracket
    fn type_floor(rank: u8) -> Option<IndexKey> {
        match rank {
            0 => Some(IndexKey::Null),
            1 => Some(IndexKey::Number(NumberKey::Float(OrderedFloat::new(f64::NEG_INFINITY)))),
            2 => Some(IndexKey::String(String::new())),
            3 => Some(IndexKey::Object(String::new())),
            4 => Some(IndexKey::Array(String::new())),
            5 => Some(IndexKey::Bool(false)),
            _ => None,
        }
    }

    /// Type bracket of the key; range comparisons only match within one bracket
    pub fn type_rank(&self) -> u8 {
        match self {
            IndexKey::Null => 0,
            IndexKey::Number(_) => 1,
            IndexKey::String(_) => 2,
            IndexKey::Object(_) => 3,
            IndexKey::Array(_) => 4,
            IndexKey::Bool(_) => 5,
        }
    }
}

/// Compare two optional JSON values in the canonical order
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    IndexKey::from_option(a).cmp(&IndexKey::from_option(b))
}

/// Sort / index direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn from_json(value: &Value) -> Result<Self> {
        match value.as_i64() {
            Some(1) => Ok(SortDirection::Ascending),
            Some(-1) => Ok(SortDirection::Descending),
            _ => Err(ShelfError::InvalidQuery(format!(
                "direction must be 1 or -1, got {}",
                value
            ))),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }

    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

/// Range comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Value interval on one index field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// (key, inclusive)
    pub lower: Option<(IndexKey, bool)>,
    pub upper: Option<(IndexKey, bool)>,
}

impl KeyRange {
    pub fn from_op(op: RangeOp, key: IndexKey) -> Self {
        match op {
            RangeOp::Gt => KeyRange { lower: Some((key, false)), upper: None },
            RangeOp::Gte => KeyRange { lower: Some((key, true)), upper: None },
            RangeOp::Lt => KeyRange { lower: None, upper: Some((key, false)) },
            RangeOp::Lte => KeyRange { lower: None, upper: Some((key, true)) },
        }
    }

    /// Narrow this range with another bound on the same field
    pub fn intersect(mut self, other: KeyRange) -> Self {
        if let Some((key, inclusive)) = other.lower {
            self.lower = match self.lower {
                Some((cur, cur_inc)) => match key.cmp(&cur) {
                    Ordering::Greater => Some((key, inclusive)),
                    Ordering::Equal => Some((cur, cur_inc && inclusive)),
                    Ordering::Less => Some((cur, cur_inc)),
                },
                None => Some((key, inclusive)),
            };
        }
        if let Some((key, inclusive)) = other.upper {
            self.upper = match self.upper {
                Some((cur, cur_inc)) => match key.cmp(&cur) {
                    Ordering::Less => Some((key, inclusive)),
                    Ordering::Equal => Some((cur, cur_inc && inclusive)),
                    Ordering::Greater => Some((cur, cur_inc)),
                },
                None => Some((key, inclusive)),
            };
        }
        self
    }

    /// Close the open side of the range at the edge of the bound's type
    /// bracket, so `$gt: 2010` never walks into string keys.
    pub fn within_type(mut self) -> Self {
        let rank = match (&self.lower, &self.upper) {
            (Some((key, _)), _) | (None, Some((key, _))) => key.type_rank(),
            (None, None) => return self,
        };
        if self.lower.is_none() {
            self.lower = IndexKey::type_floor(rank).map(|key| (key, true));
        }
        if self.upper.is_none() {
            self.upper = IndexKey::type_floor(rank + 1).map(|key| (key, false));
        }
        self
    }

    /// Where `key` falls relative to the range, in ascending value order
    fn position(&self, key: &IndexKey) -> Ordering {
        if let Some((lower, inclusive)) = &self.lower {
            match key.cmp(lower) {
                Ordering::Less => return Ordering::Less,
                Ordering::Equal if !inclusive => return Ordering::Less,
                _ => {}
            }
        }
        if let Some((upper, inclusive)) = &self.upper {
            match key.cmp(upper) {
                Ordering::Greater => return Ordering::Greater,
                Ordering::Equal if !inclusive => return Ordering::Greater,
                _ => {}
            }
        }
        Ordering::Equal
    }
}

/// Index definition: ordered (field, direction) list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<(String, SortDirection)>,
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(fields: Vec<(String, SortDirection)>, unique: bool) -> Result<Self> {
        if fields.is_empty() {
            return Err(ShelfError::InvalidQuery("index needs at least one field".into()));
        }
        for (i, (field, _)) in fields.iter().enumerate() {
            if field.is_empty() || field.starts_with('$') {
                return Err(ShelfError::InvalidQuery(format!("invalid index field: '{}'", field)));
            }
            if fields[..i].iter().any(|(f, _)| f == field) {
                return Err(ShelfError::InvalidQuery(format!("field '{}' appears twice in index", field)));
            }
        }

        let name = fields
            .iter()
            .map(|(field, dir)| format!("{}_{}", field, dir.as_i32()))
            .collect::<Vec<_>>()
            .join("_");

        Ok(IndexDefinition { name, fields, unique })
    }

    /// Parse `{ "author": 1, "published_year": -1 }`
    pub fn from_json(spec: &Value, unique: bool) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| ShelfError::InvalidQuery("index spec must be an object".into()))?;

        let mut fields = Vec::with_capacity(obj.len());
        for (field, dir) in obj {
            fields.push((field.clone(), SortDirection::from_json(dir)?));
        }
        Self::new(fields, unique)
    }

    pub fn leading_field(&self) -> &str {
        &self.fields[0].0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Asc(IndexKey),
    Desc(Reverse<IndexKey>),
}

impl KeyPart {
    fn new(direction: SortDirection, key: IndexKey) -> Self {
        match direction {
            SortDirection::Ascending => KeyPart::Asc(key),
            SortDirection::Descending => KeyPart::Desc(Reverse(key)),
        }
    }

    fn key(&self) -> &IndexKey {
        match self {
            KeyPart::Asc(key) => key,
            KeyPart::Desc(Reverse(key)) => key,
        }
    }
}

/// Equality prefix plus optional range on the following field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBounds {
    pub equals: Vec<IndexKey>,
    pub range: Option<KeyRange>,
}

/// One ordered index. Maps key tuples to document slots (insertion
/// sequence numbers) so equal keys come back in insertion order.
#[derive(Debug, Clone)]
pub struct Index {
    definition: IndexDefinition,
    entries: BTreeMap<Vec<KeyPart>, BTreeSet<u64>>,
    num_entries: usize,
}

impl Index {
    pub fn new(definition: IndexDefinition) -> Self {
        Index {
            definition,
            entries: BTreeMap::new(),
            num_entries: 0,
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Number of indexed documents
    pub fn size(&self) -> usize {
        self.num_entries
    }

    /// Number of distinct key tuples
    pub fn distinct_keys(&self) -> usize {
        self.entries.len()
    }

    fn key_for(&self, doc: &Document) -> Vec<KeyPart> {
        self.definition
            .fields
            .iter()
            .map(|(field, dir)| KeyPart::new(*dir, IndexKey::from_option(doc.value_at(field).as_deref())))
            .collect()
    }

    /// Would storing `doc` in `slot` break the unique constraint?
    pub fn check_unique(&self, doc: &Document, slot: u64) -> Result<()> {
        if !self.definition.unique {
            return Ok(());
        }
        let key = self.key_for(doc);
        match self.entries.get(&key) {
            Some(slots) if slots.iter().any(|s| *s != slot) => Err(ShelfError::DuplicateKey(format!(
                "index '{}' already contains {:?}",
                self.definition.name,
                key.iter().map(KeyPart::key).collect::<Vec<_>>()
            ))),
            _ => Ok(()),
        }
    }

    pub fn insert(&mut self, doc: &Document, slot: u64) -> Result<()> {
        self.check_unique(doc, slot)?;
        let key = self.key_for(doc);
        if self.entries.entry(key).or_default().insert(slot) {
            self.num_entries += 1;
        }
        Ok(())
    }

    pub fn remove(&mut self, doc: &Document, slot: u64) {
        let key = self.key_for(doc);
        if let Some(slots) = self.entries.get_mut(&key) {
            if slots.remove(&slot) {
                self.num_entries -= 1;
            }
            if slots.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Slots matching the bounds, in index order
    pub fn scan(&self, bounds: &IndexBounds) -> Vec<u64> {
        let prefix_len = bounds.equals.len().min(self.definition.fields.len());
        let range = if prefix_len < self.definition.fields.len() {
            bounds.range.as_ref()
        } else {
            None
        };

        let mut start: Vec<KeyPart> = bounds.equals[..prefix_len]
            .iter()
            .zip(&self.definition.fields)
            .map(|(key, (_, dir))| KeyPart::new(*dir, key.clone()))
            .collect();

        if let Some(range) = range {
            let dir = self.definition.fields[prefix_len].1;
            let first = match dir {
                SortDirection::Ascending => range.lower.as_ref(),
                SortDirection::Descending => range.upper.as_ref(),
            };
            if let Some((key, _)) = first {
                start.push(KeyPart::new(dir, key.clone()));
            }
        }

        let prefix = &start[..prefix_len];
        let position = |parts: &[KeyPart]| -> Ordering {
            let head = parts[..prefix_len].cmp(prefix);
            if head != Ordering::Equal {
                return head;
            }
            match range {
                Some(range) => {
                    let dir = self.definition.fields[prefix_len].1;
                    dir.apply(range.position(parts[prefix_len].key()))
                }
                None => Ordering::Equal,
            }
        };

        self.entries
            .range((Bound::Included(start.clone()), Bound::Unbounded))
            .skip_while(|(parts, _)| position(parts.as_slice()) == Ordering::Less)
            .take_while(|(parts, _)| position(parts.as_slice()) == Ordering::Equal)
            .flat_map(|(_, slots)| slots.iter().copied())
            .collect()
    }

    /// Every slot ordered by the first `prefix_len` fields; slots sharing
    /// those key values come out in insertion order.
    pub fn sorted(&self, prefix_len: usize, reverse: bool) -> Vec<u64> {
        let prefix_len = prefix_len.clamp(1, self.definition.fields.len());
        let mut result = Vec::with_capacity(self.num_entries);
        let mut group: Vec<u64> = Vec::new();
        let mut group_key: Option<&[KeyPart]> = None;

        let entries: Box<dyn Iterator<Item = (&Vec<KeyPart>, &BTreeSet<u64>)> + '_> = if reverse {
            Box::new(self.entries.iter().rev())
        } else {
            Box::new(self.entries.iter())
        };

        for (parts, slots) in entries {
            let head = &parts[..prefix_len];
            if group_key != Some(head) {
                group.sort_unstable();
                result.append(&mut group);
                group_key = Some(head);
            }
            group.extend(slots.iter().copied());
        }
        group.sort_unstable();
        result.append(&mut group);

        result
    }
}

/// Index Manager - manages all indexes for a collection
#[derive(Debug, Clone, Default)]
pub struct IndexManager {
    indexes: Vec<Index>,
}

impl IndexManager {
    pub fn new() -> Self {
        IndexManager { indexes: Vec::new() }
    }

    /// Register a new index and back-fill it from `docs`.
    ///
    /// Returns the index name and whether it was newly created. An identical
    /// definition, or a plain request for fields already indexed as unique,
    /// is a no-op.
    pub fn create_index<'a, I>(&mut self, definition: IndexDefinition, docs: I) -> Result<(String, bool)>
    where
        I: IntoIterator<Item = (u64, &'a Document)>,
    {
        if let Some(existing) = self.indexes.iter().find(|idx| idx.definition.name == definition.name) {
            let covers = existing.definition.fields == definition.fields
                && (existing.definition.unique || !definition.unique);
            if covers {
                return Ok((definition.name, false));
            }
            return Err(ShelfError::InvalidQuery(format!(
                "index '{}' already exists with different options",
                definition.name
            )));
        }

        let mut index = Index::new(definition);
        for (slot, doc) in docs {
            index.insert(doc, slot)?;
        }

        let name = index.name().to_string();
        self.indexes.push(index);
        Ok((name, true))
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        let before = self.indexes.len();
        self.indexes.retain(|idx| idx.name() != name);
        if self.indexes.len() == before {
            return Err(ShelfError::IndexNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|idx| idx.name() == name)
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// Index names in creation order
    pub fn list_indexes(&self) -> Vec<String> {
        self.indexes.iter().map(|idx| idx.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Check every unique constraint before anything is written
    pub fn validate(&self, doc: &Document, slot: u64) -> Result<()> {
        self.indexes.iter().try_for_each(|idx| idx.check_unique(doc, slot))
    }

    pub fn on_insert(&mut self, doc: &Document, slot: u64) -> Result<()> {
        self.validate(doc, slot)?;
        for index in &mut self.indexes {
            index.insert(doc, slot)?;
        }
        Ok(())
    }

    pub fn on_update(&mut self, before: &Document, after: &Document, slot: u64) -> Result<()> {
        self.validate(after, slot)?;
        for index in &mut self.indexes {
            index.remove(before, slot);
            index.insert(after, slot)?;
        }
        Ok(())
    }

    pub fn on_delete(&mut self, doc: &Document, slot: u64) {
        for index in &mut self.indexes {
            index.remove(doc, slot);
        }
    }

    /// First index whose leading field is `field`
    fn leading(&self, field: &str) -> Option<&Index> {
        self.indexes.iter().find(|idx| idx.definition.leading_field() == field)
    }

    /// Equality lookup on a single field; `None` when no index leads with it
    pub fn lookup(&self, field: &str, value: &Value) -> Option<Vec<u64>> {
        let index = self.leading(field)?;
        let mut slots = index.scan(&IndexBounds {
            equals: vec![IndexKey::from(value)],
            range: None,
        });
        slots.sort_unstable();
        Some(slots)
    }

    /// Ordered range scan on a single field
    pub fn range_scan(&self, field: &str, op: RangeOp, value: &Value) -> Option<Vec<u64>> {
        let index = self.leading(field)?;
        Some(index.scan(&IndexBounds {
            equals: Vec::new(),
            range: Some(KeyRange::from_op(op, IndexKey::from(value)).within_type()),
        }))
    }

    /// Every slot ordered by `field`, ties in insertion order
    pub fn sorted_scan(&self, field: &str, direction: SortDirection) -> Option<Vec<u64>> {
        let index = self.leading(field)?;
        let reverse = index.definition.fields[0].1 != direction;
        Some(index.sorted(1, reverse))
    }
}
