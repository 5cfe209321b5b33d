//! Path normalization for uploaded report paths. Coverage tools disagree on
//! separators and relative segments; the canonical form is forward-slash
//! separated, case-sensitive, with `./` stripped and `../` collapsed without
//! ever escaping the uploaded root.

/// Normalize a tool-reported path to canonical form.
#[must_use]
pub fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                // A leading ".." cannot escape the uploaded root; drop it.
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if absolute {
                    segments.pop();
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}
