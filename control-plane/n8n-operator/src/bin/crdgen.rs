use kube::core::CustomResourceExt;
use n8n_operator::crd::n8n::N8n;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&N8n::crd())?;
    println!("{yaml}");
    Ok(())
}
