//! `${N}` placeholder substitution for dialogue strings.
//!
//! A backslash escapes `$` or `{`. Placeholders that are out of range, not a
//! decimal integer, or unterminated are left in the output verbatim.

use crate::variant::Variant;

pub fn interpolate(template: &str, values: &[Variant]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(&next) = chars.peek() {
                    if next == '$' || next == '{' {
                        chars.next();
                        out.push(next);
                        continue;
                    }
                }
                out.push('\\');
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for b in chars.by_ref() {
                    if b == '}' {
                        closed = true;
                        break;
                    }
                    body.push(b);
                }
                if !closed {
                    out.push_str("${");
                    out.push_str(&body);
                    break;
                }
                match body.parse::<usize>() {
                    Ok(index) if index < values.len() => {
                        out.push_str(&values[index].to_string());
                    }
                    _ => {
                        out.push_str("${");
                        out.push_str(&body);
                        out.push('}');
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Vec<Variant> {
        vec![Variant::from("world"), Variant::Int(3)]
    }

    #[test]
    fn substitutes_by_index() {
        assert_eq!(
            interpolate("Hello, ${0}! You have ${1} keys.", &values()),
            "Hello, world! You have 3 keys."
        );
    }

    #[test]
    fn escapes_suppress_placeholders() {
        assert_eq!(interpolate(r"price: \${0}", &values()), "price: ${0}");
        assert_eq!(interpolate(r"brace: \{0}", &values()), "brace: {0}");
        // A backslash before anything else is literal.
        assert_eq!(interpolate(r"path\to", &values()), r"path\to");
    }

    #[test]
    fn out_of_range_and_malformed_stay_verbatim() {
        assert_eq!(interpolate("${9}", &values()), "${9}");
        assert_eq!(interpolate("${one}", &values()), "${one}");
        assert_eq!(interpolate("${}", &values()), "${}");
        assert_eq!(interpolate("tail ${0", &values()), "tail ${0");
    }

    #[test]
    fn bare_dollar_is_literal() {
        assert_eq!(interpolate("cost: $5", &values()), "cost: $5");
    }

    #[test]
    fn coerces_values_through_display() {
        let vals = vec![Variant::Nil, Variant::Double(1.5)];
        assert_eq!(interpolate("${0}/${1}", &vals), "undefined/1.5");
    }
}
