use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // Create config template if it doesn't exist
    let out_dir = env::var("OUT_DIR").unwrap_or_else(|_| "./".to_string());
    let template_path = Path::new(&out_dir).join("../../../config.template.toml");
    
    let template = r#"# tsengine Configuration Template
# Copy this file to 'tsengine.toml' and fill in your actual values

dvr_device = "/dev/dvb/adapter0/dvr0"
database_path = "./tsengine.db"
tune_timeout_secs = 30
tables_timeout_secs = 5
remove_failed_frequencies = false
read_batch_size = 20
"#;
    
    let _ = fs::write(template_path, template);
    println!("cargo:rerun-if-changed=build.rs");
}
