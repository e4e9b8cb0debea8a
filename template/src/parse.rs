use anyhow::Result;

#[derive(Debug, thiserror::Error)]
#[error("ParseError on line '{line}': {msg}")]
pub struct Error {
    msg: String,
    pos: usize,
    line: String,
}

impl Error {
    fn new(text: &str, pos: usize, msg: String) -> Self {
        // isolate the line in question:
        let before = &text[0..pos];
        let after = &text[pos..text.len()];
        let prefix: String = before.chars().rev().take_while(|&c| c != '\n').collect();
        let prefix: String = prefix.chars().rev().collect();
        let suffix: String = after.chars().take_while(|&c| c != '\n').collect();
        let line = prefix + &suffix;
        Self { pos, line, msg }
    }
}

/// A piece of a config template: literal text, or a `{name}` placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split template text into literal and placeholder segments.
pub fn parse_template(text: &str) -> Result<Vec<Segment<'_>>> {
    use combine::EasyParser;
    template::template()
        .easy_parse(text)
        .map(|(segments, _remainder)| segments)
        .map_err(|e| {
            let pos = e.position.translate_position(text);
            // since converting combine's errors is a lifetime nightmare,
            // we just stringify the error before returning it.
            Error::new(text, pos, format!("{}", e)).into()
        })
}

/// Parse `--plugin_args` text (`key=value, key2='quoted, value'`) into pairs.
pub fn parse_plugin_args(text: &str) -> Result<Vec<(&str, &str)>> {
    use combine::EasyParser;
    plugin_args::plugin_args()
        .easy_parse(text)
        .map(|(pairs, _remainder)| pairs)
        .map_err(|e| {
            let pos = e.position.translate_position(text);
            Error::new(text, pos, format!("{}", e)).into()
        })
}

pub mod prelude {
    pub use combine::parser::char::{char, string};
    pub use combine::parser::range::recognize;
    pub use combine::*;
}

mod util {

    use super::prelude::*;
    use combine::parser::char::{alpha_num, letter, space};

    p! {
        ident_start() -> char, {
            char('_').or(letter())
        }
    }

    p! {
        ident_rest() -> Vec<char>, {
            many(char('_').or(alpha_num()))
        }
    }

    p! {
        ident() -> &'a str, {
            recognize(ident_start().and(ident_rest()))
        }
    }

    p! {
        whitespace() -> (), {
            skip_many1(space().map(|_| ()))
        }
    }

    wrapper! {
        lex(parser), {
            optional(whitespace()).with(parser).skip(optional(whitespace()))
        }
    }

    p! {
        line_internal_whitespace() -> (), {
            skip_many1(satisfy(|c: char| c.is_whitespace() && c != '\n'))
        }
    }

    wrapper! {
        lex_inline(parser), {
            optional(line_internal_whitespace())
                .with(parser)
                .skip(optional(line_internal_whitespace()))
        }
    }

}

mod template {

    use super::prelude::*;
    use super::util::{ident, lex_inline};
    use super::Segment;

    p! {
        text() -> &'a str, {
            recognize(skip_many1(none_of("{}".chars())))
        }
    }

    // "{{" and "}}" stand for a single literal brace:
    p! {
        escaped_brace() -> &'a str, {
            recognize(attempt(string("{{")).or(attempt(string("}}"))))
                .map(|s: &'a str| &s[..1])
        }
    }

    p! {
        placeholder() -> &'a str, {
            char('{').with(lex_inline(ident())).skip(char('}'))
        }
    }

    p! {
        segment() -> Segment<'a>, {
            text()
                .map(Segment::Text)
                .or(escaped_brace().map(Segment::Text))
                .or(placeholder().map(Segment::Placeholder))
        }
    }

    p! {
        template() -> Vec<Segment<'a>>, {
            many(segment()).skip(eof())
        }
    }

}

mod plugin_args {

    use super::prelude::*;
    use super::util::{ident, lex, lex_inline, whitespace};

    p! {
        quoted_value() -> &'a str, {
            char('\'')
                .with(recognize(skip_many(none_of("'".chars()))))
                .skip(char('\''))
                .or(char('"')
                    .with(recognize(skip_many(none_of("\"".chars()))))
                    .skip(char('"')))
        }
    }

    p! {
        bare_value() -> &'a str, {
            recognize(skip_many1(none_of(",'\"".chars()))).map(|s: &'a str| s.trim())
        }
    }

    p! {
        pair() -> (&'a str, &'a str), {
            ident()
                .skip(lex_inline(char('=')))
                .and(quoted_value().or(bare_value()))
        }
    }

    p! {
        plugin_args() -> Vec<(&'a str, &'a str)>, {
            optional(whitespace())
                .with(sep_by(lex(pair()), char(',')))
                .skip(eof())
        }
    }

    #[cfg(test)]
    mod test {
        use anyhow::Result;
        use combine::EasyParser;
        #[test]
        fn test_plugin_args() -> Result<()> {
            assert_eq!(
                vec![("n_procs", "8"), ("sbatch_args", "--mem=4G -p normal, or not")],
                super::plugin_args()
                    .easy_parse("n_procs=8, sbatch_args='--mem=4G -p normal, or not'")
                    .unwrap()
                    .0
            );
            assert_eq!(
                vec![("poll_interval", "5")],
                super::plugin_args().easy_parse(" poll_interval = \"5\" ").unwrap().0
            );
            assert!(super::plugin_args().easy_parse("").unwrap().0.is_empty());
            Ok(())
        }
        #[test]
        fn test_bad_plugin_args() {
            assert!(super::plugin_args().easy_parse("n_procs").is_err());
            assert!(super::plugin_args().easy_parse("n_procs=1,").is_err());
        }
    }
}
