use pmw_core::PmwError;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// `{"status": "success", "data": ...}`
pub fn print_success<T: Serialize>(data: &T) -> anyhow::Result<()> {
    print_json(&serde_json::json!({ "status": "success", "data": data }))
}

/// The failure was already printed; `main` only sets the exit code.
#[derive(Debug)]
pub struct Reported;

impl std::fmt::Display for Reported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation failed")
    }
}

impl std::error::Error for Reported {}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

/// Print a failed operation with its category and a recovery hint.
pub fn print_error(operation: &str, err: &anyhow::Error, json: bool) {
    let core = err.chain().find_map(|c| c.downcast_ref::<PmwError>());
    let category = core.map_or("internal", |e| e.category().as_str());
    let hint = core.map(PmwError::recovery_hint);

    if json {
        let value = serde_json::json!({
            "status": "error",
            "operation": operation,
            "category": category,
            "message": format!("{err:#}"),
            "hint": hint,
        });
        match serde_json::to_string_pretty(&value) {
            Ok(s) => println!("{s}"),
            Err(_) => eprintln!("error: {err:#}"),
        }
        return;
    }

    eprintln!("error: {operation} failed [{category}]: {err:#}");
    if let Some(hint) = hint {
        eprintln!("hint: {hint}");
    }
}

pub fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(",")
    }
}
