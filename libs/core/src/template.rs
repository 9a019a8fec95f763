//! Placeholder substitution for stored message templates.
//!
//! Rendering is a pure single pass and never fails: recognized tokens are
//! replaced, anything else is copied through verbatim so a malformed template
//! degrades to odd-looking text instead of blocking delivery.

/// Variable bag available to every template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub client_name: String,
    pub date: String,
    pub time: String,
    pub service: String,
    /// Pre-formatted currency string, e.g. `"35,00"`.
    pub price: String,
    pub staff: String,
    pub business_name: String,
    pub business_address: String,
}

/// Canonical token names as authored in the admin UI.
const TOKENS: [&str; 8] = [
    "cliente_nome",
    "data",
    "horario",
    "servico",
    "preco",
    "profissional",
    "barbearia_nome",
    "barbearia_endereco",
];

/// Older templates were authored with a double-brace syntax. Each entry maps
/// a legacy token onto its canonical name.
const LEGACY_ALIASES: [(&str, &str); 8] = [
    ("{cliente_nome}", "cliente_nome"),
    ("{data}", "data"),
    ("{horario}", "horario"),
    ("{servico}", "servico"),
    ("{preco}", "preco"),
    ("{profissional}", "profissional"),
    ("{barbearia_nome}", "barbearia_nome"),
    ("{barbearia_endereco}", "barbearia_endereco"),
];

impl TemplateVars {
    fn value_of(&self, token: &str) -> Option<&str> {
        let value = match token {
            "cliente_nome" => &self.client_name,
            "data" => &self.date,
            "horario" => &self.time,
            "servico" => &self.service,
            "preco" => &self.price,
            "profissional" => &self.staff,
            "barbearia_nome" => &self.business_name,
            "barbearia_endereco" => &self.business_address,
            _ => return None,
        };
        Some(value.as_str())
    }
}

/// Renders `body` against `vars`.
///
/// Both `{token}` and the legacy `{{token}}` spellings resolve through the
/// same variable set; unrecognized tokens stay in the output untouched.
///
/// ```
/// use trimline_core::{render_template, TemplateVars};
///
/// let vars = TemplateVars {
///     client_name: "João".into(),
///     ..Default::default()
/// };
/// assert_eq!(render_template("Olá {cliente_nome}!", &vars), "Olá João!");
/// assert_eq!(render_template("Olá {{cliente_nome}}!", &vars), "Olá João!");
/// assert_eq!(render_template("{unknown_var}", &vars), "{unknown_var}");
/// ```
pub fn render_template(body: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        match consume_token(rest, vars) {
            Some((value, consumed)) => {
                out.push_str(value);
                rest = &rest[consumed..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Tries to read a recognized token at the head of `rest`; returns its value
/// and how many bytes the token spelling occupies.
fn consume_token<'a>(rest: &str, vars: &'a TemplateVars) -> Option<(&'a str, usize)> {
    let double = rest.starts_with("{{");
    let inner_start = if double { 2 } else { 1 };
    let close = rest[inner_start..].find('}')? + inner_start;
    let token = &rest[inner_start..close];
    if double && !rest[close..].starts_with("}}") {
        return None;
    }
    if double {
        // Legacy spelling resolves through the alias table.
        let canonical = LEGACY_ALIASES
            .iter()
            .find(|(legacy, _)| legacy.trim_start_matches('{').trim_end_matches('}') == token)
            .map(|(_, canonical)| *canonical)?;
        let value = vars.value_of(canonical)?;
        return Some((value, close + 2));
    }
    if !TOKENS.contains(&token) {
        return None;
    }
    let value = vars.value_of(token)?;
    Some((value, close + 1))
}

/// Formats a price stored in cents the way the original templates expect
/// (`3500` → `"35,00"`).
pub fn format_price_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{sign}{},{:02}", cents / 100, cents % 100)
}
