use anyhow::{Context, Result};
use tracing::info;

/// Load .env file from current directory or any parent directory.
/// Searches from the current working directory up to the filesystem root,
/// loading the first .env file found.
pub fn load_dotenv_from_ancestors() -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    let mut current = cwd.as_path();
    loop {
        let env_path = current.join(".env");
        if env_path.exists() {
            dotenvy::from_path(&env_path)
                .with_context(|| format!("Failed to load .env from {}", env_path.display()))?;
            info!("Loaded .env from {}", env_path.display());
            return Ok(());
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }

    anyhow::bail!(
        "No .env file found.\n\n\
        Searched from {} to filesystem root.",
        cwd.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_load_dotenv_from_current_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(".env"), "WALCAST_ENV_CURRENT=hello").unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();
        std::env::remove_var("WALCAST_ENV_CURRENT");

        let result = load_dotenv_from_ancestors();
        assert!(result.is_ok(), "Should find .env in current directory");
        assert_eq!(std::env::var("WALCAST_ENV_CURRENT").unwrap(), "hello");

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("WALCAST_ENV_CURRENT");
    }

    #[test]
    #[serial]
    fn test_load_dotenv_from_grandparent_directory() {
        let grandparent_dir = TempDir::new().unwrap();
        let child_dir = grandparent_dir.path().join("parent").join("child");
        fs::create_dir_all(&child_dir).unwrap();
        fs::write(
            grandparent_dir.path().join(".env"),
            "WALCAST_ENV_GRANDPARENT=nested",
        )
        .unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&child_dir).unwrap();
        std::env::remove_var("WALCAST_ENV_GRANDPARENT");

        let result = load_dotenv_from_ancestors();
        assert!(result.is_ok(), "Should find .env in grandparent directory");
        assert_eq!(std::env::var("WALCAST_ENV_GRANDPARENT").unwrap(), "nested");

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("WALCAST_ENV_GRANDPARENT");
    }

    #[test]
    #[serial]
    fn test_load_dotenv_prefers_closest_env_file() {
        let parent_dir = TempDir::new().unwrap();
        let child_dir = parent_dir.path().join("subdir");
        fs::create_dir(&child_dir).unwrap();

        fs::write(parent_dir.path().join(".env"), "WALCAST_ENV_CLOSEST=parent").unwrap();
        fs::write(child_dir.join(".env"), "WALCAST_ENV_CLOSEST=child").unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&child_dir).unwrap();
        std::env::remove_var("WALCAST_ENV_CLOSEST");

        assert!(load_dotenv_from_ancestors().is_ok());
        assert_eq!(std::env::var("WALCAST_ENV_CLOSEST").unwrap(), "child");

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("WALCAST_ENV_CLOSEST");
    }

    #[test]
    #[serial]
    fn test_load_dotenv_error_when_not_found() {
        let temp_dir = TempDir::new().unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();

        let result = load_dotenv_from_ancestors();

        std::env::set_current_dir(original_dir).unwrap();

        // A stray .env above the temp dir would be found; only check the
        // message when the search came up empty.
        if let Err(e) = result {
            assert!(e.to_string().contains("No .env file found"));
        }
    }
}
