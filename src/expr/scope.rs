use super::ExprError;
use super::value::Value;
use std::collections::BTreeMap;

/// Declared kind of a leaf symbol, used for scope checking at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Bool,
    Number,
    Str,
    Duration,
    List,
}

impl LeafKind {
    pub fn of_json(value: &serde_json::Value) -> LeafKind {
        match value {
            serde_json::Value::Bool(_) => LeafKind::Bool,
            serde_json::Value::Number(_) => LeafKind::Number,
            serde_json::Value::String(_) => LeafKind::Str,
            serde_json::Value::Array(_) => LeafKind::List,
            serde_json::Value::Null | serde_json::Value::Object(_) => LeafKind::Number,
        }
    }
}

/// A tree of symbol tables. Objects are typed leaves; a subtable may share a
/// name with an object (the bare name then resolves as a boolean while the
/// qualified names reach into the subtable).
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    objects: BTreeMap<String, LeafKind>,
    subtables: BTreeMap<String, SymbolTable>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, name: &str, kind: LeafKind) {
        self.objects.entry(name.to_string()).or_insert(kind);
    }

    pub fn subtable_mut(&mut self, name: &str) -> &mut SymbolTable {
        self.subtables.entry(name.to_string()).or_default()
    }

    /// Descend (creating as needed) through `path` and return the table at
    /// its end.
    pub fn ensure_path(&mut self, path: &[&str]) -> &mut SymbolTable {
        let mut table = self;
        for segment in path {
            table = table.subtable_mut(segment);
        }
        table
    }

    pub fn objects(&self) -> impl Iterator<Item = (&String, &LeafKind)> {
        self.objects.iter()
    }

    pub fn subtables(&self) -> impl Iterator<Item = (&String, &SymbolTable)> {
        self.subtables.iter()
    }

    pub fn has_object(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    /// Resolve a `:`-separated path to a declared leaf kind. A path naming a
    /// subtable without a matching object resolves as a presence boolean.
    pub fn lookup(&self, path: &[String]) -> Option<LeafKind> {
        let (last, prefix) = path.split_last()?;
        let mut table = self;
        for segment in prefix {
            table = table.subtables.get(segment)?;
        }
        if let Some(kind) = table.objects.get(last) {
            return Some(*kind);
        }
        if table.subtables.contains_key(last) {
            return Some(LeafKind::Bool);
        }
        None
    }

    /// Bind every subtable that lacks an object of the same name as a
    /// presence boolean, recursively.
    pub fn complete_with_presence(&mut self) {
        let names: Vec<String> = self.subtables.keys().cloned().collect();
        for name in names {
            if !self.objects.contains_key(&name) {
                self.objects.insert(name.clone(), LeafKind::Bool);
            }
            self.subtables
                .get_mut(&name)
                .expect("subtable exists")
                .complete_with_presence();
        }
    }
}

/// Resolves symbol paths to runtime values during evaluation.
pub trait EvalContext {
    fn resolve(&self, path: &[String]) -> Result<Value, ExprError>;
}

/// Context over a flat `path -> value` map, with presence booleans for every
/// path prefix. Used by the dependency solver where the candidate assignment
/// is exactly such a map.
pub struct MapContext<'a> {
    entries: &'a BTreeMap<String, Value>,
}

impl<'a> MapContext<'a> {
    pub fn new(entries: &'a BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl EvalContext for MapContext<'_> {
    fn resolve(&self, path: &[String]) -> Result<Value, ExprError> {
        let joined = path.join(":");
        if let Some(value) = self.entries.get(&joined) {
            return Ok(value.clone());
        }
        // a prefix of a provided symbol is present in the assignment
        let prefix = format!("{}:", joined);
        if self.entries.keys().any(|key| key.starts_with(&prefix)) {
            return Ok(Value::Bool(true));
        }
        Err(ExprError::Missing { path: joined })
    }
}
