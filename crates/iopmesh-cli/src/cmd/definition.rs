use crate::table::Table;
use crate::ui;
use iopmesh_types::definition::{detect_variants, Definition};
use iopmesh_types::iop::IopCategory;
use std::path::{Path, PathBuf};

/// Read and validate a definition file, exiting on failure.
pub(crate) fn read_definition(path: &Path) -> Definition {
    let json = std::fs::read_to_string(path)
        .unwrap_or_else(|e| ui::fail(&format!("Cannot read {}: {e}", path.display())));
    Definition::from_json(&json)
        .unwrap_or_else(|e| ui::fail(&format!("Invalid definition {}: {e}", path.display())))
}

pub(crate) fn iop_table(definition: &Definition) -> Table {
    let mut table = Table::new(&["Category", "Name", "Type"]);
    for category in IopCategory::ALL {
        for iop in definition.iops(category) {
            table.add_row(&[
                category.to_string(),
                iop.name.clone(),
                iop.value_type.to_string(),
            ]);
        }
    }
    table
}

pub fn cmd_definition_show(file: &Path, json: bool) {
    let definition = read_definition(file);
    if json {
        match definition.to_json() {
            Ok(text) => println!("{text}"),
            Err(e) => ui::fail(&e.to_string()),
        }
        return;
    }

    ui::section(&format!("Definition {}", definition.name));
    if !definition.version.is_empty() {
        ui::kv("Version", &definition.version);
    }
    if !definition.description.is_empty() {
        ui::kv("Description", &definition.description);
    }
    ui::kv_ok("Fingerprint", &definition.fingerprint().to_string());
    ui::blank();

    let table = iop_table(&definition);
    if table.is_empty() {
        ui::hint("no IOPs declared");
    } else {
        table.print();
    }
}

pub fn cmd_definition_variants(files: &[PathBuf]) {
    let definitions: Vec<Definition> = files.iter().map(|f| read_definition(f)).collect();
    let variants = detect_variants(&definitions);
    if variants.is_empty() {
        ui::check_ok(&format!(
            "No variants among {} definition(s)",
            definitions.len()
        ));
        return;
    }

    for (name, version) in &variants {
        ui::check_warn(&format!("{name} {version} exists in several structures"));
        for (file, def) in files.iter().zip(&definitions) {
            if &def.name == name && &def.version == version {
                ui::kv(&def.fingerprint().to_string(), &file.display().to_string());
            }
        }
    }
}
