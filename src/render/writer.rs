use nu_ansi_term::{Color, Style};

/// Turns rendered segment texts into final display text
pub struct PromptWriter {
    use_colors: bool,
}

impl PromptWriter {
    pub fn new(plain: bool) -> Self {
        Self { use_colors: !plain }
    }

    /// Paint one piece of text with optional foreground/background names
    pub fn paint(&self, text: &str, foreground: Option<&str>, background: Option<&str>) -> String {
        if !self.use_colors || text.is_empty() {
            return text.to_string();
        }

        let mut style = Style::new();
        if let Some(color) = foreground.and_then(parse_color) {
            style = style.fg(color);
        }
        if let Some(color) = background.and_then(parse_color) {
            style = style.on(color);
        }

        if style == Style::new() {
            return text.to_string();
        }
        style.paint(text).to_string()
    }

    /// Join painted segments of one block, skipping empty ones
    pub fn join(&self, parts: &[String]) -> String {
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Named, 256-colour index or `#rrggbb`
fn parse_color(name: &str) -> Option<Color> {
    let name = name.trim();
    if let Some(hex) = name.strip_prefix('#') {
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        return Some(Color::Rgb(channel(0)?, channel(2)?, channel(4)?));
    }
    if let Ok(index) = name.parse::<u8>() {
        return Some(Color::Fixed(index));
    }

    let color = match name.to_lowercase().replace('-', "_").as_str() {
        "black" => Color::Black,
        "red" => Color::Red,
        "green" => Color::Green,
        "yellow" => Color::Yellow,
        "blue" => Color::Blue,
        "magenta" => Color::Magenta,
        "purple" => Color::Purple,
        "cyan" => Color::Cyan,
        "white" => Color::White,
        "dark_gray" | "darkgray" => Color::DarkGray,
        "light_red" => Color::LightRed,
        "light_green" => Color::LightGreen,
        "light_yellow" => Color::LightYellow,
        "light_blue" => Color::LightBlue,
        "light_magenta" => Color::LightMagenta,
        "light_cyan" => Color::LightCyan,
        "light_gray" => Color::LightGray,
        _ => return None,
    };
    Some(color)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_skips_escapes() {
        let writer = PromptWriter::new(true);
        assert_eq!(writer.paint("~/src", Some("blue"), None), "~/src");
    }

    #[test]
    fn test_colored_output() {
        let writer = PromptWriter::new(false);
        let painted = writer.paint("~/src", Some("blue"), Some("#102030"));
        assert!(painted.contains("~/src"));
        assert!(painted.starts_with("\x1b["));
        assert_ne!(painted, "~/src");
    }

    #[test]
    fn test_unknown_color_is_plain() {
        let writer = PromptWriter::new(false);
        assert_eq!(writer.paint("x", Some("p:accent"), None), "x");
    }

    #[test]
    fn test_join_skips_empty() {
        let writer = PromptWriter::new(true);
        let parts = vec!["a".to_string(), String::new(), "b".to_string()];
        assert_eq!(writer.join(&parts), "a b");
    }

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("dark-gray"), Some(Color::DarkGray));
        assert_eq!(parse_color("208"), Some(Color::Fixed(208)));
        assert_eq!(parse_color("#ff0000"), Some(Color::Rgb(255, 0, 0)));
        assert_eq!(parse_color("#fff"), None);
    }
}
