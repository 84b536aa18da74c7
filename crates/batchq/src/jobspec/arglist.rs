//! Conversion between an ordered argument list and its single-string form.
//!
//! Tokens are separated by whitespace. Double quotes group text and allow `\"` and `\\`
//! escapes, single quotes group text literally and a backslash outside of quotes escapes the
//! following character. Adjacent segments are concatenated into one token, so `a"b c"` is the
//! single token `ab c`.
use nom::branch::alt;
use nom::bytes::complete::{is_not, take_while};
use nom::character::complete::{anychar, char, multispace0, multispace1};
use nom::combinator::map;
use nom::multi::{fold_many0, fold_many1, separated_list0};
use nom::sequence::{delimited, preceded};

use crate::common::parser::{NomResult, consume_all};

fn p_escaped_char(input: &str) -> NomResult<String> {
    map(preceded(char('\\'), anychar), |c| c.to_string())(input)
}

fn p_double_quoted(input: &str) -> NomResult<String> {
    delimited(
        char('"'),
        fold_many0(
            alt((map(is_not("\"\\"), |s: &str| s.to_string()), p_escaped_char)),
            String::new,
            |mut acc, part| {
                acc.push_str(&part);
                acc
            },
        ),
        char('"'),
    )(input)
}

fn p_single_quoted(input: &str) -> NomResult<String> {
    map(
        delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        |s: &str| s.to_string(),
    )(input)
}

fn p_bare(input: &str) -> NomResult<String> {
    fold_many1(
        alt((
            map(is_not(" \t\r\n\"'\\"), |s: &str| s.to_string()),
            p_escaped_char,
        )),
        String::new,
        |mut acc, part| {
            acc.push_str(&part);
            acc
        },
    )(input)
}

fn p_token(input: &str) -> NomResult<String> {
    fold_many1(
        alt((p_double_quoted, p_single_quoted, p_bare)),
        String::new,
        |mut acc, part| {
            acc.push_str(&part);
            acc
        },
    )(input)
}

fn p_arglist(input: &str) -> NomResult<Vec<String>> {
    delimited(
        multispace0,
        separated_list0(multispace1, p_token),
        multispace0,
    )(input)
}

/// Splits a single-string argument list into tokens.
pub fn parse_arglist(input: &str) -> anyhow::Result<Vec<String>> {
    consume_all(p_arglist, input)
        .map_err(|e| anyhow::anyhow!("Invalid argument list `{input}`: {e}"))
}

fn needs_quoting(token: &str) -> bool {
    token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'))
}

fn quote_token(token: &str) -> String {
    let mut quoted = String::with_capacity(token.len() + 2);
    quoted.push('"');
    for c in token.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Joins tokens into a single string that [`parse_arglist`] splits back into the same tokens.
pub fn format_arglist<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if needs_quoting(arg) {
                quote_token(arg)
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
