//! Reading and writing PostgreSQL configuration files.
//!
//! Every write reports whether the file changed, so that callers can decide whether the
//! server needs a reload.

use std::{
    fs,
    io::{self, ErrorKind},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read {}", path.display()))]
    ReadFile { source: io::Error, path: PathBuf },

    #[snafu(display("failed to write {}", path.display()))]
    WriteFile { source: io::Error, path: PathBuf },

    #[snafu(display("failed to create directory {}", path.display()))]
    CreateDirectory { source: io::Error, path: PathBuf },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Contents of `path`, `None` if it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(source).context(ReadFileSnafu { path }),
    }
}

/// Writes `contents` unless the file already holds exactly that. `mode` is applied to newly
/// created and to existing files alike.
pub fn write_if_changed(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<bool> {
    let current = match fs::read(path) {
        Ok(current) => Some(current),
        Err(error) if error.kind() == ErrorKind::NotFound => None,
        Err(source) => return Err(source).context(ReadFileSnafu { path }),
    };

    let changed = current.as_deref() != Some(contents);
    if changed {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(CreateDirectorySnafu { path: parent })?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        if let Some(mode) = mode {
            options.mode(mode);
        }
        options
            .open(path)
            .and_then(|mut file| io::Write::write_all(&mut file, contents))
            .context(WriteFileSnafu { path })?;
    }
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .context(WriteFileSnafu { path })?;
    }
    Ok(changed)
}

/// Creates an empty file unless it exists.
pub fn touch(path: &Path) -> Result<bool> {
    if path.try_exists().context(ReadFileSnafu { path })? {
        return Ok(false);
    }
    fs::File::create(path).context(WriteFileSnafu { path })?;
    Ok(true)
}

/// Quotes a value for `postgresql.conf`.
pub fn quote_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn setting_name(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.starts_with('#') {
        return None;
    }
    line.split(['=', ' ', '\t'])
        .next()
        .filter(|name| !name.is_empty())
}

/// Sets `settings` in the configuration file at `path`, keeping all other lines.
///
/// Existing occurrences of a setting are replaced in place, new settings are appended in the
/// given order.
pub fn update_settings(path: &Path, settings: &[(&str, String)]) -> Result<bool> {
    let current = read_optional(path)?.unwrap_or_default();

    let mut written = vec![false; settings.len()];
    let mut lines = Vec::new();
    for line in current.lines() {
        let position = setting_name(line)
            .and_then(|name| settings.iter().position(|(key, _)| *key == name));
        match position {
            // duplicates of a setting are dropped
            Some(index) if written[index] => {}
            Some(index) => {
                let (key, value) = &settings[index];
                lines.push(format!("{key} = {value}"));
                written[index] = true;
            }
            None => lines.push(line.to_string()),
        }
    }
    for ((key, value), _) in settings
        .iter()
        .zip(&written)
        .filter(|(_, written)| !**written)
    {
        lines.push(format!("{key} = {value}"));
    }

    let mut contents = lines.join("\n");
    contents.push('\n');
    write_if_changed(path, contents.as_bytes(), None)
}

/// Drops every line setting `name`. A missing file has nothing to remove.
pub fn remove_setting(path: &Path, name: &str) -> Result<bool> {
    let Some(current) = read_optional(path)? else {
        return Ok(false);
    };

    let kept: Vec<_> = current
        .lines()
        .filter(|line| setting_name(line) != Some(name))
        .collect();
    if kept.len() == current.lines().count() {
        return Ok(false);
    }

    let mut contents = kept.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    write_if_changed(path, contents.as_bytes(), None)
}
