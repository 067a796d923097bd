use std::fs;

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    // The analysis core has no storage layer: result loading and filesystem
    // persistence belong to the host driver. Fail the build if those concerns
    // creep into the (flat) src/ module list.
    let forbidden = [
        "polars::",
        "CsvReader",
        "LazyFrame",
        "enkf_fs",
        "gen_data",
        "meas_data",
    ];

    let mut leaks = Vec::new();
    for entry in fs::read_dir("src").expect("src/ must be readable").flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("rs") {
            continue;
        }
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        for (line_no, line) in text.lines().enumerate() {
            if let Some(token) = forbidden.iter().find(|token| line.contains(*token)) {
                leaks.push(format!("{}:{}: '{token}'", path.display(), line_no + 1));
            }
        }
    }

    if !leaks.is_empty() {
        for leak in &leaks {
            eprintln!("storage-layer token in analysis core: {leak}");
        }
        panic!("{} boundary violation(s) in src/", leaks.len());
    }
}
