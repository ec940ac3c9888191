use parking_lot::RwLock;

/// Operators who asked for verbose reporting. Debug output stays on while
/// any of them remains.
#[derive(Debug, Default)]
pub struct DebugState {
    owners: RwLock<Vec<String>>,
}

impl DebugState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or remove `owner`. Returns whether debug output is now enabled.
    pub fn set(&self, enabled: bool, owner: &str) -> bool {
        let mut owners = self.owners.write();
        if enabled {
            if !owners.iter().any(|o| o == owner) {
                owners.push(owner.to_string());
            }
        } else {
            owners.retain(|o| o != owner);
        }
        !owners.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        !self.owners.read().is_empty()
    }

    pub fn owners(&self) -> Vec<String> {
        self.owners.read().clone()
    }

    pub fn clear(&self) {
        self.owners.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_while_any_owner_remains() {
        let debug = DebugState::new();
        assert!(!debug.is_enabled());
        assert!(debug.set(true, "alice"));
        assert!(debug.set(true, "bob"));
        assert!(debug.set(true, "alice"));
        assert_eq!(debug.owners(), vec!["alice".to_string(), "bob".to_string()]);
        assert!(debug.set(false, "alice"));
        assert!(!debug.set(false, "bob"));
        assert!(debug.owners().is_empty());
    }
}
