use crate::schema::WorkflowVariable;
use serde_json::Value;
use std::collections::HashMap;

/// Variables visible to template substitution during a run.
pub type Variables = HashMap<String, String>;

/// Seed a run's variable set: environment first, then every enabled workflow
/// variable on top of it.
pub fn initial_variables(env_vars: &Variables, workflow_vars: &[WorkflowVariable]) -> Variables {
    let mut vars = env_vars.clone();
    for var in workflow_vars.iter().filter(|v| v.enabled) {
        vars.insert(var.key.clone(), var.value.clone());
    }
    vars
}

/// Later values win.
pub fn merge(target: &mut Variables, extracted: &Variables) {
    for (key, value) in extracted {
        target.insert(key.clone(), value.clone());
    }
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}
