use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error};

use crate::error::Result;

pub const MAX_CALLBACK_ARGS: usize = 8;

pub type ExitAction = Arc<dyn Fn(&[String]) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    action: String,
    args: Vec<String>,
}

#[derive(Default)]
struct Registry {
    actions: HashMap<String, ExitAction>,
    stack: Vec<Registration>,
    exit_code: Option<i32>,
}

#[derive(Clone, Default)]
pub struct ExitCallbacks {
    inner: Arc<Mutex<Registry>>,
}

impl ExitCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn define<F>(&self, name: &str, action: F)
    where
        F: Fn(&[String]) -> Result<()> + Send + Sync + 'static,
    {
        self.registry()
            .actions
            .insert(name.to_string(), Arc::new(action));
    }

    pub fn register<S: AsRef<str>>(&self, action: &str, args: &[S]) -> bool {
        if args.len() > MAX_CALLBACK_ARGS {
            return false;
        }
        let mut registry = self.registry();
        if !registry.actions.contains_key(action) {
            return false;
        }
        registry.stack.push(Registration {
            action: action.to_string(),
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
        });
        debug!(action, depth = registry.stack.len(), "exit callback registered");
        true
    }

    pub fn unregister<S: AsRef<str>>(&self, action: &str, args: &[S]) -> bool {
        let wanted = Registration {
            action: action.to_string(),
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
        };
        let mut registry = self.registry();
        match registry.stack.iter().rposition(|r| *r == wanted) {
            Some(pos) => {
                registry.stack.remove(pos);
                debug!(action, depth = registry.stack.len(), "exit callback removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.registry().stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_exit_code(&self, code: i32) -> bool {
        let mut registry = self.registry();
        if registry.exit_code.is_some() {
            return false;
        }
        registry.exit_code = Some(code);
        true
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.registry().exit_code
    }

    pub fn run_callbacks(&self) -> usize {
        let mut failures = 0;
        loop {
            let next = {
                let mut registry = self.registry();
                match registry.stack.pop() {
                    Some(r) => {
                        let action = registry.actions.get(&r.action).cloned();
                        Some((r, action))
                    }
                    None => None,
                }
            };
            let Some((registration, action)) = next else {
                break;
            };
            let Some(action) = action else {
                continue;
            };
            debug!(action = %registration.action, "running exit callback");
            if let Err(err) = action(&registration.args) {
                error!(action = %registration.action, args = ?registration.args, "exit callback failed: {}", err);
                failures += 1;
            }
        }
        failures
    }

    /// Run all callbacks and return the code the process should exit with:
    /// the first code ever recorded, or `code` if none was.
    pub fn finish(&self, code: i32) -> i32 {
        self.set_exit_code(code);
        self.run_callbacks();
        self.exit_code().unwrap_or(code)
    }

    pub fn controlled_exit(&self, code: i32) -> ! {
        let code = self.finish(code);
        std::process::exit(code);
    }
}
