//! Linux-safe path component sanitization for model ids and artifact names.

const NAME_MAX: usize = 255;

/// Sanitizes one path component for safe use on Linux.
///
/// - Replaces NUL, `/`, `\`, `:`, whitespace and control characters with `_`
/// - Collapses consecutive underscores
/// - Trims leading/trailing dots and underscores (no `..` escapes)
/// - Limits length to 255 bytes (Linux NAME_MAX)
pub fn sanitize_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let mapped = match c {
            '\0' | '/' | '\\' | ':' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        };
        if mapped == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(mapped);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    let mut take = trimmed.len().min(NAME_MAX);
    while take > 0 && !trimmed.is_char_boundary(take) {
        take -= 1;
    }
    trimmed[..take].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ids_become_single_components() {
        assert_eq!(sanitize_component("meta-llama/Llama-3-8B"), "meta-llama_Llama-3-8B");
        assert_eq!(sanitize_component("llama3:8b"), "llama3_8b");
    }

    #[test]
    fn traversal_is_neutralised() {
        assert_eq!(sanitize_component("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_component(".."), "");
    }

    #[test]
    fn collapses_and_trims() {
        assert_eq!(sanitize_component("  model   weights.bin "), "model_weights.bin");
        assert_eq!(sanitize_component("file\x00name.txt"), "file_name.txt");
    }

    #[test]
    fn long_names_are_cut_on_char_boundary() {
        let name = "é".repeat(200);
        let out = sanitize_component(&name);
        assert!(out.len() <= NAME_MAX);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
