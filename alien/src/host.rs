use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{AlienError, Context, Result, Value};

/// A host command. Commands receive the owning context so they can issue
/// further native calls.
pub type Command =
    Arc<dyn Fn(&Context, &[Value]) -> Result<Value> + Send + Sync>;

/// Qualifies `name` into the global namespace unless already qualified.
pub fn qualify(name: &str) -> String {
    if name.starts_with("::") {
        name.to_string()
    } else {
        format!("::{name}")
    }
}

/// Glob matching with `*` and `?`, used by the list/delete operations.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// The interpreter side of the boundary: a command table keyed by
/// qualified name and a variable table for output parameters.
#[derive(Default)]
pub struct Host {
    commands: RwLock<HashMap<String, Command>>,
    variables: RwLock<HashMap<String, Value>>,
}

impl Host {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `command` under the qualified form of `name`, replacing
    /// any previous command of that name.
    pub fn register(&self, name: &str, command: Command) -> String {
        let qualified = qualify(name);
        log::debug!("registering command {qualified}");
        self.commands.write().insert(qualified.clone(), command);
        qualified
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let qualified = qualify(name);
        match self.commands.write().remove(&qualified) {
            Some(_) => Ok(()),
            None => Err(AlienError::not_found("Command", &qualified)),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Command> {
        self.commands.read().get(&qualify(name)).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.commands.read().contains_key(&qualify(name))
    }

    pub fn command_names(&self, pattern: &str) -> Vec<String> {
        let pattern = qualify(pattern);
        let mut names: Vec<String> = self
            .commands
            .read()
            .keys()
            .filter(|name| glob_match(&pattern, name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    pub fn set_var(&self, name: &str, value: Value) {
        self.variables.write().insert(name.to_string(), value);
    }

    pub fn unset_var(&self, name: &str) -> Option<Value> {
        self.variables.write().remove(name)
    }
}

impl Context {
    /// Invokes a command prefix: the first element names the command and
    /// the remaining elements are prepended to `args`.
    pub fn invoke(&self, prefix: &Value, args: &[Value]) -> Result<Value> {
        let words = prefix.as_list()?;
        let Some((name, leading)) = words.split_first() else {
            return Err(AlienError::invalid("Empty command prefix."));
        };
        let name = name.to_string();
        // The table lock is released before the command runs so the
        // command may register or delete commands itself.
        let command = self
            .host
            .lookup(&name)
            .ok_or_else(|| AlienError::not_found("Command", &name))?;
        let mut full = Vec::with_capacity(leading.len() + args.len());
        full.extend_from_slice(leading);
        full.extend_from_slice(args);
        command(self, &full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("::a*", "::abc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("*b*", "abc"));
        assert!(!glob_match("x*", "abc"));
    }

    #[test]
    fn commands_are_qualified() {
        let host = Host::new();
        let cmd: Command = Arc::new(|_: &Context, args: &[Value]| Ok(Value::from(args.len())));
        assert_eq!(host.register("echo", cmd), "::echo");
        assert!(host.exists("::echo"));
        assert!(host.exists("echo"));
        assert_eq!(host.command_names("e*"), vec!["::echo".to_string()]);
        host.unregister("echo").unwrap();
        assert!(host.unregister("echo").is_err());
    }

    #[test]
    fn invoke_prepends_prefix_words() {
        let ctx = Context::default();
        ctx.host.register(
            "join",
            Arc::new(|_: &Context, args: &[Value]| Ok(Value::list(args.iter().cloned()))),
        );
        let result = ctx
            .invoke(&Value::from("join a"), &[Value::from("b")])
            .unwrap();
        assert_eq!(result.to_string(), "a b");
    }
}
