use std::collections::HashMap;

/// A key binding within a [`KeyTable`] (spec §3).
#[derive(Debug, Clone)]
pub struct KeyBinding {
    pub trigger: u32,
    pub command: String,
    pub repeat: bool,
    pub table: String,
    pub transition_table: Option<String>,
}

/// A named set of key bindings (spec §3). tmux calls these "key tables";
/// the default ones are `prefix` and `root`, but config can define more.
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    pub name: String,
    pub bindings: HashMap<u32, KeyBinding>,
}

impl KeyTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: HashMap::new(),
        }
    }
}
