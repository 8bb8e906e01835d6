use crate::cmd::definition::read_definition;
use crate::table::Table;
use crate::ui;
use iopmesh_types::iop::IopCategory;
use iopmesh_types::mapping::MappingDocument;
use std::path::Path;

pub fn cmd_mapping_show(file: &Path, definition: Option<&Path>) {
    let json = std::fs::read_to_string(file)
        .unwrap_or_else(|e| ui::fail(&format!("Cannot read {}: {e}", file.display())));
    let doc = MappingDocument::from_json(&json)
        .unwrap_or_else(|e| ui::fail(&format!("Invalid mapping {}: {e}", file.display())));
    let definition = definition.map(read_definition);

    let title = if doc.name.is_empty() { "(unnamed)" } else { doc.name.as_str() };
    ui::section(&format!("Mapping {title}"));
    if !doc.version.is_empty() {
        ui::kv("Version", &doc.version);
    }
    ui::kv("Elements", &doc.mappings.len().to_string());
    ui::blank();

    if doc.mappings.is_empty() {
        ui::hint("no mapping elements");
        return;
    }

    let mut table = Table::new(&["Id", "Input", "Agent", "Output"]);
    let mut unknown = Vec::new();
    for entry in &doc.mappings {
        table.add_row(&[
            entry.id().to_string(),
            entry.input_name.clone(),
            entry.agent_name.clone(),
            entry.output_name.clone(),
        ]);
        if let Some(def) = &definition {
            if def.find(IopCategory::Input, &entry.input_name).is_none() {
                unknown.push(entry);
            }
        }
    }
    table.print();

    if let Some(def) = &definition {
        ui::blank();
        if unknown.is_empty() {
            ui::check_ok(&format!("Every input exists in {}", def.name));
        }
        for entry in unknown {
            ui::check_warn(&format!(
                "{entry}: {} has no input '{}'",
                def.name, entry.input_name
            ));
        }
    }
}
