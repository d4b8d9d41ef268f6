//! State types declared as data.
//!
//! A [`StateType`] lists its fields, computed fields and handlers. Types are
//! registered into a [`StateRegistry`] under a parent type, forming the type
//! tree every client's state tree is instantiated from. A child type reads and
//! writes the fields of its ancestors; it cannot redeclare them.

use crate::error::{Result, SyncError};
use crate::event::{Args, BackgroundContext, HandlerContext, HandlerError, HandlerOutput};
use crate::state::StateNode;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Name of the root field holding page and session information.
pub const ROUTER_FIELD: &str = "router";

/// Name of the generic setter every state type carries.
pub const SETVAR_HANDLER: &str = "setvar";

/// Prefix of auto-generated per-field setters.
pub const SETTER_PREFIX: &str = "set_";

/// Derives a computed field's value from the node it lives on.
pub type ComputeFn = Arc<dyn Fn(&StateNode) -> Result<Value> + Send + Sync>;

/// Foreground handler body, run while the token's lease is held.
pub type HandlerFn =
    Arc<dyn Fn(&mut HandlerContext, &Args) -> std::result::Result<HandlerOutput, HandlerError> + Send + Sync>;

/// Background handler body, run on its own thread outside the lease.
pub type BackgroundFn =
    Arc<dyn Fn(&BackgroundContext, &Args) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// A declared field.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub default: Value,
    /// Backend-only fields are persisted but never sent to the UI.
    pub backend: bool,
    /// Fields created by the registry itself (no auto-setter).
    pub builtin: bool,
}

/// A derived field with declared dependencies.
#[derive(Clone)]
pub struct ComputedDef {
    pub name: String,
    pub deps: Vec<String>,
    pub compute: ComputeFn,
}

impl fmt::Debug for ComputedDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedDef")
            .field("name", &self.name)
            .field("deps", &self.deps)
            .finish()
    }
}

#[derive(Clone)]
pub enum HandlerKind {
    Foreground(HandlerFn),
    Background(BackgroundFn),
}

/// A declared handler: parameter names plus the body.
#[derive(Clone)]
pub struct HandlerDef {
    pub name: String,
    pub params: Vec<String>,
    pub kind: HandlerKind,
}

impl HandlerDef {
    pub fn is_background(&self) -> bool {
        matches!(self.kind, HandlerKind::Background(_))
    }
}

impl fmt::Debug for HandlerDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("background", &self.is_background())
            .finish()
    }
}

/// Declaration of one state type.
#[derive(Clone, Debug)]
pub struct StateType {
    name: String,
    fields: Vec<FieldDef>,
    computed: Vec<ComputedDef>,
    handlers: Vec<HandlerDef>,
}

impl StateType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            computed: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a field with its default value.
    pub fn field(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            default: default.into(),
            backend: false,
            builtin: false,
        });
        self
    }

    /// Declare a backend-only field.
    pub fn backend_field(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            default: default.into(),
            backend: true,
            builtin: false,
        });
        self
    }

    /// Declare a computed field recomputed whenever one of `deps` changes.
    pub fn computed<F>(mut self, name: impl Into<String>, deps: &[&str], compute: F) -> Self
    where
        F: Fn(&StateNode) -> Result<Value> + Send + Sync + 'static,
    {
        self.computed.push(ComputedDef {
            name: name.into(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            compute: Arc::new(compute),
        });
        self
    }

    /// Declare a foreground handler.
    pub fn handler<F>(mut self, name: impl Into<String>, params: &[&str], body: F) -> Self
    where
        F: Fn(&mut HandlerContext, &Args) -> std::result::Result<HandlerOutput, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.push(HandlerDef {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            kind: HandlerKind::Foreground(Arc::new(body)),
        });
        self
    }

    /// Declare a background handler.
    pub fn background<F>(mut self, name: impl Into<String>, params: &[&str], body: F) -> Self
    where
        F: Fn(&BackgroundContext, &Args) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.push(HandlerDef {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            kind: HandlerKind::Background(Arc::new(body)),
        });
        self
    }
}

/// A type placed in the type tree.
#[derive(Clone, Debug)]
pub struct RegisteredType {
    /// Declared path, e.g. `"state.todo"`.
    pub path: String,
    pub name: String,
    pub parent: Option<usize>,
    /// Child type indices in registration order.
    pub children: Vec<usize>,
    pub fields: Vec<FieldDef>,
    pub computed: Vec<ComputedDef>,
    pub handlers: BTreeMap<String, HandlerDef>,
    /// Fields of this type or its ancestors that some descendant's computed
    /// fields depend on.
    pub descendant_deps: BTreeSet<String>,
}

impl RegisteredType {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn computed_field(&self, name: &str) -> Option<&ComputedDef> {
        self.computed.iter().find(|c| c.name == name)
    }

    pub fn handler(&self, name: &str) -> Option<&HandlerDef> {
        self.handlers.get(name)
    }
}

/// Process-wide tree of state types.
#[derive(Clone, Debug)]
pub struct StateRegistry {
    types: Vec<RegisteredType>,
    by_path: HashMap<String, usize>,
}

impl StateRegistry {
    /// Create a registry whose root is `root`.
    ///
    /// The root carries a built-in `router` field.
    pub fn new(root: StateType) -> Result<Self> {
        let mut registry = Self {
            types: Vec::new(),
            by_path: HashMap::new(),
        };
        let mut root = root;
        if root.fields.iter().any(|f| f.name == ROUTER_FIELD) {
            return Err(SyncError::ConfigValidation(format!(
                "field name {ROUTER_FIELD:?} is reserved on the root state"
            )));
        }
        root.fields.insert(
            0,
            FieldDef {
                name: ROUTER_FIELD.to_string(),
                default: Value::map::<&str>([]),
                backend: false,
                builtin: true,
            },
        );
        registry.insert(None, root)?;
        Ok(registry)
    }

    /// Register `ty` as a child of the type at `parent_path`. Returns the new
    /// type's declared path.
    pub fn register(&mut self, parent_path: &str, ty: StateType) -> Result<String> {
        let parent = *self.by_path.get(parent_path).ok_or_else(|| {
            SyncError::ConfigValidation(format!("unknown parent state {parent_path:?}"))
        })?;
        self.insert(Some(parent), ty)
    }

    fn insert(&mut self, parent: Option<usize>, ty: StateType) -> Result<String> {
        if ty.name.is_empty() || ty.name.contains('.') {
            return Err(SyncError::ConfigValidation(format!(
                "invalid state name {:?}",
                ty.name
            )));
        }
        let path = match parent {
            Some(p) => format!("{}.{}", self.types[p].path, ty.name),
            None => ty.name.clone(),
        };
        if self.by_path.contains_key(&path) {
            return Err(SyncError::ConfigValidation(format!("duplicate state {path:?}")));
        }

        let mut seen = BTreeSet::new();
        for name in ty
            .fields
            .iter()
            .map(|f| &f.name)
            .chain(ty.computed.iter().map(|c| &c.name))
        {
            if !seen.insert(name.clone()) {
                return Err(SyncError::ConfigValidation(format!(
                    "field {name:?} declared twice on {path}"
                )));
            }
            if let Some(owner) = parent.and_then(|p| self.declaring_type(p, name)) {
                return Err(SyncError::ConfigValidation(format!(
                    "field {name:?} on {path} shadows a field of {}",
                    self.types[owner].path
                )));
            }
        }
        for computed in &ty.computed {
            for dep in &computed.deps {
                let local = seen.contains(dep);
                let inherited = parent.and_then(|p| self.declaring_type(p, dep)).is_some();
                if !local && !inherited {
                    return Err(SyncError::ConfigValidation(format!(
                        "computed field {:?} on {path} depends on unknown field {dep:?}",
                        computed.name
                    )));
                }
            }
        }

        let mut handlers = BTreeMap::new();
        for handler in ty.handlers {
            if handlers.contains_key(&handler.name) {
                return Err(SyncError::ConfigValidation(format!(
                    "handler {:?} declared twice on {path}",
                    handler.name
                )));
            }
            handlers.insert(handler.name.clone(), handler);
        }
        for field in ty.fields.iter().filter(|f| !f.backend && !f.builtin) {
            let setter = format!("{SETTER_PREFIX}{}", field.name);
            handlers
                .entry(setter.clone())
                .or_insert_with(|| auto_setter(setter, field.name.clone()));
        }
        handlers
            .entry(SETVAR_HANDLER.to_string())
            .or_insert_with(setvar_handler);

        let index = self.types.len();
        // Ancestor fields referenced by this type's computed fields.
        let inherited_deps: BTreeSet<String> = ty
            .computed
            .iter()
            .flat_map(|c| c.deps.iter())
            .filter(|d| !seen.contains(*d))
            .cloned()
            .collect();
        let mut ancestor = parent;
        while let Some(a) = ancestor {
            self.types[a].descendant_deps.extend(inherited_deps.iter().cloned());
            ancestor = self.types[a].parent;
        }

        self.types.push(RegisteredType {
            path: path.clone(),
            name: ty.name,
            parent,
            children: Vec::new(),
            fields: ty.fields,
            computed: ty.computed,
            handlers,
            descendant_deps: BTreeSet::new(),
        });
        if let Some(p) = parent {
            self.types[p].children.push(index);
        }
        self.by_path.insert(path.clone(), index);
        Ok(path)
    }

    /// Index of the type (from `start` upward) declaring field `name`.
    pub fn declaring_type(&self, start: usize, name: &str) -> Option<usize> {
        let mut current = Some(start);
        while let Some(index) = current {
            let ty = &self.types[index];
            if ty.field(name).is_some() || ty.computed_field(name).is_some() {
                return Some(index);
            }
            current = ty.parent;
        }
        None
    }

    pub fn root(&self) -> &RegisteredType {
        &self.types[0]
    }

    pub fn get(&self, index: usize) -> &RegisteredType {
        &self.types[index]
    }

    pub fn index_of(&self, path: &str) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    pub fn types(&self) -> &[RegisteredType] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn foreground<F>(body: F) -> HandlerKind
where
    F: Fn(&mut HandlerContext, &Args) -> std::result::Result<HandlerOutput, HandlerError> + Send + Sync + 'static,
{
    HandlerKind::Foreground(Arc::new(body))
}

fn auto_setter(name: String, field: String) -> HandlerDef {
    HandlerDef {
        name,
        params: vec!["value".to_string()],
        kind: foreground(move |ctx, args| {
            ctx.set(&field, args.value("value")?)?;
            Ok(HandlerOutput::None)
        }),
    }
}

fn setvar_handler() -> HandlerDef {
    HandlerDef {
        name: SETVAR_HANDLER.to_string(),
        params: vec!["var".to_string(), "value".to_string()],
        kind: foreground(|ctx, args| {
            let var = args.str("var")?;
            if !ctx.is_settable(&var) {
                return Err(HandlerError::new(format!("Invalid var passed to setvar: {var}")));
            }
            ctx.set(&var, args.value("value")?)?;
            Ok(HandlerOutput::None)
        }),
    }
}
