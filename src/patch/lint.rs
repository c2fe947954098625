//! ESLint output parsing

use std::collections::BTreeMap;

/// Map each file named in ESLint's default formatter output to its error lines.
///
/// File headers are lines starting with `./` (joined onto `base_dir`) or `/`.
/// Lines before the first header are ignored.
pub fn parse_eslint(lint_output: &str, base_dir: &str) -> BTreeMap<String, Vec<String>> {
    let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in lint_output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(relative) = line.strip_prefix("./") {
            let path = format!("{}/{}", base_dir.trim_end_matches('/'), relative);
            result.entry(path.clone()).or_default();
            current = Some(path);
        } else if line.starts_with('/') {
            result.entry(line.to_string()).or_default();
            current = Some(line.to_string());
        } else if let Some(path) = &current {
            if let Some(errors) = result.get_mut(path) {
                errors.push(line.to_string());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_errors_by_file() {
        let output = "\n> next lint\n\n./app/settings/page.tsx\n\
                      12:7  Error: 'x' is assigned a value but never used.  no-unused-vars\n\
                      /app/frontend/components/nav.tsx\n\
                      3:1  Error: Missing key prop  react/jsx-key\n\
                      4:1  Warning: something\n";
        let parsed = parse_eslint(output, "/app/frontend");

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["/app/frontend/app/settings/page.tsx"].len(), 1);
        assert_eq!(parsed["/app/frontend/components/nav.tsx"].len(), 2);
    }

    #[test]
    fn test_clean_output_is_empty() {
        assert!(parse_eslint("✔ No ESLint warnings or errors", "/app/frontend").is_empty());
    }
}
