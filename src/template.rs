//! Minimal `{{ .Field }}` substitution for segment templates.

/// Replace every `{{ .Name }}` in `template` with the matching field value.
/// Unknown fields render as the empty string; text outside placeholders is
/// copied through unchanged, including an unterminated `{{`.
pub fn render(template: &str, fields: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let name = after_open[..end].trim().trim_start_matches('.');
        if let Some((_, value)) = fields.iter().find(|(field, _)| *field == name) {
            out.push_str(value);
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}
