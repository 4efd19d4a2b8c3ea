//! Plan identity and rendering.

use sha2::{Digest, Sha256};

use crate::properties::BuildProperties;
use crate::step::Step;

/// SHA-256 over the ordered step names. Two plans with the same steps in the
/// same order share a digest.
pub fn plan_digest(steps: &[Step]) -> String {
    let mut hasher = Sha256::new();
    for step in steps {
        hasher.update(step.name.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

/// One line per step: name, then the command it would run against `props`
/// (or the step kind for in-process steps).
pub fn describe(steps: &[Step], props: &BuildProperties) -> Vec<String> {
    steps
        .iter()
        .map(|step| {
            let action = match step.kind.command(props) {
                Ok(Some(cmd)) => cmd.to_string(),
                Ok(None) => "(internal)".to_string(),
                Err(_) => "(resolved at run time)".to_string(),
            };
            let mut flags = Vec::new();
            if step.always_run {
                flags.push("always".to_string());
            }
            if let Some(lock) = &step.lock {
                flags.push(format!("lock={lock}"));
            }
            if flags.is_empty() {
                format!("{}: {action}", step.name)
            } else {
                format!("{} [{}]: {action}", step.name, flags.join(","))
            }
        })
        .collect()
}
