//! Environment variables consumed by the inference server
//!
//! The resolved storage paths and cache locations are exported through a generated shell
//! script (`storage-env.sh`) that the vLLM service sources before starting.

use crate::config::StorageConfig;
use crate::error::{IoResultExt, StorageResult};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const MODEL_PREFIX: &str = "CITADEL_MODEL_";
const CACHE_VARS: [&str; 5] = [
    "HF_HOME",
    "HUGGINGFACE_HUB_CACHE",
    "TRANSFORMERS_CACHE",
    "TORCH_HOME",
    "VLLM_CACHE_ROOT",
];

/// Build the full variable set from the configuration
pub fn storage_environment(config: &StorageConfig) -> BTreeMap<String, String> {
    let p = &config.paths;
    let mut vars = BTreeMap::new();

    let mut put = |key: &str, path: &Path| {
        vars.insert(key.to_string(), path.display().to_string());
    };

    put("CITADEL_APP_ROOT", &p.app_root);
    put("CITADEL_APP_MODELS", &p.app_models);
    put("CITADEL_APP_CONFIGS", &p.app_configs);
    put("CITADEL_APP_SCRIPTS", &p.app_scripts);
    put("CITADEL_APP_LOGS", &p.app_logs);
    put("CITADEL_MODELS_ROOT", &p.models_root);
    put("CITADEL_MODELS_ACTIVE", &p.models_active);
    put("CITADEL_MODELS_ARCHIVE", &p.models_archive);
    put("CITADEL_MODELS_STAGING", &p.models_staging);
    put("CITADEL_CACHE_ROOT", &p.cache_root);
    put("CITADEL_DOWNLOADS_ROOT", &p.downloads_root);
    put("CITADEL_BACKUP_ROOT", &p.backup_root);
    put("CITADEL_BACKUP_MODELS", &p.backup_models);
    put("CITADEL_BACKUP_SYSTEM", &p.backup_system);

    put("HF_HOME", &p.hf_cache);
    put("HUGGINGFACE_HUB_CACHE", &p.hf_cache);
    put("TRANSFORMERS_CACHE", &p.transformers_cache);
    put("TORCH_HOME", &p.torch_cache);
    put("VLLM_CACHE_ROOT", &p.vllm_cache);

    for alias in config.models.convenience_links.keys() {
        if let Some(dir) = config.models.resolve_alias(alias) {
            let key = format!("{}{}", MODEL_PREFIX, shell_name(alias));
            vars.insert(key, p.models_active.join(dir).display().to_string());
        }
    }

    vars
}

/// Render the variables as a sourceable bash script, grouped by purpose
pub fn render_env_script(vars: &BTreeMap<String, String>) -> String {
    let is_model = |k: &str| k.starts_with(MODEL_PREFIX);
    let is_cache = |k: &str| CACHE_VARS.iter().any(|c| *c == k);

    let mut out = String::from(
        "#!/bin/bash\n# Storage environment configuration\n# Generated by citadel-storage\n",
    );

    let mut section = |title: &str, filter: &dyn Fn(&str) -> bool| {
        out.push_str(&format!("\n# {}\n", title));
        for (key, value) in vars.iter().filter(|(k, _)| filter(k.as_str())) {
            out.push_str(&format!("export {}=\"{}\"\n", key, shell_escape(value)));
        }
    };

    section("Storage Paths", &|k: &str| {
        k.starts_with("CITADEL_") && !is_model(k)
    });
    section("Cache Configuration", &|k: &str| is_cache(k));
    section("Model-Specific Paths", &|k: &str| is_model(k));

    out
}

/// Write the script atomically to `app_configs/storage-env.sh` with mode 0755
pub fn write_env_script(config: &StorageConfig) -> StorageResult<PathBuf> {
    let path = config.paths.env_script();
    let content = render_env_script(&storage_environment(config));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }

    // Atomic write: write to temp file, then rename
    let temp_file = path.with_extension("sh.tmp");
    {
        let mut file = std::fs::File::create(&temp_file).at(&temp_file)?;
        file.write_all(content.as_bytes()).at(&temp_file)?;
        file.sync_all().at(&temp_file)?;
    }
    std::fs::set_permissions(&temp_file, std::fs::Permissions::from_mode(0o755))
        .at(&temp_file)?;
    std::fs::rename(&temp_file, &path).at(&path)?;

    tracing::info!(path = %path.display(), "Environment script generated");
    Ok(path)
}

fn shell_name(alias: &str) -> String {
    alias
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn shell_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
