//! Print the Agent CustomResourceDefinition as YAML.

use agentbox_operator::crd::Agent;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Agent::crd())?);
    Ok(())
}
