use anyhow::bail;

/// Splits `"(inner)rest"` into `("inner", "rest")`, honoring nested parentheses inside `inner`.
///
/// The text must start with an opening parenthesis, and that parenthesis must be closed.
pub fn paren_partition(text: &str) -> anyhow::Result<(&str, &str)> {
    if !text.starts_with('(') {
        bail!("expected '(' at the start of '{}'", text);
    }

    let mut depth = 0usize;
    for (idx, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&text[1..idx], &text[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    bail!("unbalanced parentheses in '{}'", text)
}
