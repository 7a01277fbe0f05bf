use crate::output::print_json;
use std::path::Path;

pub fn run(root: &Path, name: Option<&str>, json: bool) -> anyhow::Result<()> {
    let name = match name {
        Some(n) => n.to_string(),
        None => root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cluster".to_string()),
    };

    let config = nodetag_core::workspace::init(root, &name)?;

    if json {
        print_json(&config)?;
    } else {
        println!("Initialized nodetag in {}", root.display());
        println!("Next: nodetag node register <system_id> --facts <facts.xml>");
    }
    Ok(())
}
