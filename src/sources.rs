//! sources.list generation for the mirror's consumers

use std::path::Path;

use anyhow::Result;
use log::debug;

use crate::config::MirrorSpec;
use crate::fetch::atomic_write;

/// One `deb` line per (mirror, distribution). The `[arch=...]` clause is
/// emitted only when the mirror restricts itself to a single architecture.
pub fn sources_list_lines(mirrors: &[MirrorSpec]) -> Vec<String> {
    let mut lines = Vec::new();
    for mirror in mirrors.iter().filter(|m| m.enabled) {
        let arch_clause = match mirror.architectures.as_slice() {
            [arch] => format!("[arch={}] ", arch),
            _ => String::new(),
        };
        for distr in &mirror.distributives {
            let line = format!(
                "deb {}file://{} {} {}",
                arch_clause,
                mirror.destination.display(),
                distr,
                mirror.sections.join(" ")
            );
            debug!("appending line: '{}'", line);
            lines.push(line);
        }
    }

    lines
}

pub fn write_sources_list(mirrors: &[MirrorSpec], output: &Path) -> Result<()> {
    let mut content = sources_list_lines(mirrors).join("\n");
    content.push('\n');
    atomic_write(output, content.as_bytes())
}
