//! Layout values shared by both report formats.

pub const TABLE_HEADERS: [&str; 2] = ["Image", "Analysis"];

pub const BRAND_COLOR_RGB: u32 = 0xD97757;

/// Spreadsheet row height in points for an analysis cell.
pub const MIN_ANALYSIS_ROW_HEIGHT: f64 = 150.0;
pub const ANALYSIS_LINE_HEIGHT: f64 = 15.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ReportBranding {
    pub title: String,
    pub taglines: Vec<String>,
    pub contact_lines: Vec<String>,
}

impl Default for ReportBranding {
    fn default() -> Self {
        Self {
            title: "EstateGenius AI".into(),
            taglines: vec![
                "Your Pricing Partner".into(),
                "Saves Hours of Internet Search".into(),
                "We Customize AI According to Your Needs".into(),
            ],
            contact_lines: vec!["Website: www.estategeniusai.com".into()],
        }
    }
}

impl ReportBranding {
    /// `REPORT_CONTACT_LINES` replaces the contact block; lines are `|`-separated.
    pub fn from_env() -> Self {
        let mut branding = Self::default();
        if let Ok(raw) = std::env::var("REPORT_CONTACT_LINES") {
            let lines = parse_contact_lines(&raw);
            if !lines.is_empty() {
                branding.contact_lines = lines;
            }
        }
        branding
    }
}

fn parse_contact_lines(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(3)
        .map(str::to_string)
        .collect()
}

pub fn analysis_row_height(text: &str) -> f64 {
    let lines = text.lines().count().max(1) as f64;
    (lines * ANALYSIS_LINE_HEIGHT).max(MIN_ANALYSIS_ROW_HEIGHT)
}

/// Maps typographic characters the standard PDF fonts lack to ASCII.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2022}' | '\u{25CF}' | '\u{25AA}' => out.push('-'),
            '\u{2013}' | '\u{2014}' | '\u{2212}' => out.push('-'),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            '\u{201C}' | '\u{201D}' => out.push('"'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' => out.push(' '),
            '\t' => out.push_str("    "),
            '\r' => {}
            _ => out.push(ch),
        }
    }
    out
}

/// Greedy word wrap. Blank input lines are kept; words longer than `width`
/// are split.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            let mut word = word;
            while word.chars().count() > width {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                let split = word
                    .char_indices()
                    .nth(width)
                    .map(|(idx, _)| idx)
                    .unwrap_or(word.len());
                lines.push(word[..split].to_string());
                word = &word[split..];
            }
            if word.is_empty() {
                continue;
            }
            let needed = if current.is_empty() {
                word.chars().count()
            } else {
                current.chars().count() + 1 + word.chars().count()
            };
            if needed > width && !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        lines.push(current);
    }
    while lines.len() > 1 && lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}
