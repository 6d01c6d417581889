//! Org-style task outline parser.
//!
//! A document is a flat run of headlines and `#` line comments. Each headline has
//! a star level, an optional `[#A]` priority, a mandatory task keyword, a title,
//! optional trailing `:tags:` and at most one content block (a single body line or
//! a `:PROPERTIES:` drawer).
//!
//! - `lexer` classifies each source line into positioned tokens.
//! - `parser` builds the `core` tree by recursive descent over those tokens.
//! - `query` adds read-only navigation for tree consumers.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /* ------------------------------ Positions ------------------------------ */

    /// Byte range into the parsed source text.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn overlaps(&self, other: &SourceRange) -> bool {
            self.start < other.end && other.start < self.end
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: top-level nodes in source order.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Document {
        #[serde(default)]
        pub nodes: Vec<Node>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Node {
        Headline(Headline),
        Comment(Comment),
    }

    impl Node {
        /// Task keyword of a headline; comments have none.
        pub fn keyword(&self) -> Option<Keyword> {
            match self {
                Node::Headline(h) => Some(h.keyword),
                Node::Comment(_) => None,
            }
        }

        pub fn range(&self) -> SourceRange {
            match self {
                Node::Headline(h) => h.range,
                Node::Comment(c) => c.range,
            }
        }

        pub fn as_headline(&self) -> Option<&Headline> {
            match self {
                Node::Headline(h) => Some(h),
                Node::Comment(_) => None,
            }
        }

        pub fn as_comment(&self) -> Option<&Comment> {
            match self {
                Node::Comment(c) => Some(c),
                Node::Headline(_) => None,
            }
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A task headline such as `** [#A] TODO Buy milk :errand:home:`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Headline {
        /// Count of leading `*`; never below 1.
        pub level: usize,
        pub priority: Option<Priority>,
        pub keyword: Keyword,
        /// Text after the keyword, trimmed, without trailing tags.
        pub title: String,
        /// Trailing tags in left-to-right order.
        pub tags: Option<Vec<String>>,
        pub content: Option<Content>,
        /// Comment lines inside `range`: before the content block or within a
        /// drawer. Comments after a headline without content are document nodes.
        #[serde(default)]
        pub comments: Vec<Comment>,
        /// Headline line through the end of its content block.
        pub range: SourceRange,
    }

    /// The single content block a headline may own.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Content {
        Properties(PropertiesDrawer),
        Body(Body),
    }

    /// `:PROPERTIES:` ... `:END:` block.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PropertiesDrawer {
        #[serde(default)]
        pub properties: Vec<Property>,
    }

    /// `:KEYWORD:value` entry. `value` is the raw remainder of the line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Property {
        pub keyword: String,
        pub value: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Body {
        pub text: String,
    }

    /// `# ...` line; `text` excludes the leading `#`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Comment {
        pub text: String,
        pub range: SourceRange,
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum Priority {
        A,
        B,
        C,
    }

    impl Priority {
        pub fn as_char(self) -> char {
            match self {
                Priority::A => 'A',
                Priority::B => 'B',
                Priority::C => 'C',
            }
        }
    }

    impl fmt::Display for Priority {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.as_char())
        }
    }

    impl FromStr for Priority {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "A" => Ok(Priority::A),
                "B" => Ok(Priority::B),
                "C" => Ok(Priority::C),
                other => Err(DomainError::UnknownPriority(other.to_string())),
            }
        }
    }

    /// Task state keyword. The vocabulary is fixed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Keyword {
        Todo,
        InProgress,
        Done,
        Kill,
    }

    impl Keyword {
        pub const ALL: [Keyword; 4] = [
            Keyword::Todo,
            Keyword::InProgress,
            Keyword::Done,
            Keyword::Kill,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                Keyword::Todo => "TODO",
                Keyword::InProgress => "INPROGRESS",
                Keyword::Done => "DONE",
                Keyword::Kill => "KILL",
            }
        }

        /// `DONE` and `KILL` close a task.
        pub fn is_done(self) -> bool {
            matches!(self, Keyword::Done | Keyword::Kill)
        }
    }

    impl fmt::Display for Keyword {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for Keyword {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Keyword::ALL
                .into_iter()
                .find(|k| k.as_str() == s)
                .ok_or_else(|| DomainError::UnknownKeyword(s.to_string()))
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("unknown task keyword {0:?} (expected TODO, INPROGRESS, DONE or KILL)")]
        UnknownKeyword(String),
        #[error("unknown priority {0:?} (expected A, B or C)")]
        UnknownPriority(String),
    }

    /* ---------------------------- Errors (syntax) ---------------------------- */

    /// First rule violation hit by the parser. Lines and columns are 1-based;
    /// columns count characters.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("{kind} at line {line}, column {column}")]
    pub struct SyntaxError {
        pub kind: ErrorKind,
        pub line: usize,
        pub column: usize,
        /// Byte offset into the source.
        pub offset: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
    pub enum ErrorKind {
        #[error("headline is missing a task keyword")]
        MissingKeyword,
        #[error("properties drawer is missing its :END: line")]
        UnterminatedDrawer,
        #[error("drawer line is not a :KEYWORD:value property")]
        MalformedProperty,
        #[error("expected a headline or a comment")]
        UnexpectedToken,
    }

}

pub mod lexer {
    //! Line-level tokenizer built on `nom`.
    //!
    //! Every source line is classified on its own (after leading indentation):
    //! - blank line: `Whitespace` trivia
    //! - `#...`: `Comment`
    //! - `*...`: `Stars`, optional `Priority`, then `Keyword` + `Title` (+ `Tags`),
    //!   or a `Text` token holding whatever failed to be a keyword
    //! - `:PROPERTIES:` / `:END:`: drawer markers
    //! - `:UPPER:value`: `Property`
    //! - anything else: `Text`
    //!
    //! The lexer never fails; deciding what is legal is the parser's job.

    use crate::core::{Keyword, Priority, SourceRange};
    use nom::{
        IResult, Offset,
        branch::alt,
        bytes::complete::{tag, take_while1},
        character::complete::{char, space0, space1},
        combinator::{all_consuming, eof, peek, rest, value},
        multi::separated_list1,
        sequence::{delimited, terminated, tuple},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TokenKind<'a> {
        Stars,
        Priority(Priority),
        Keyword(Keyword),
        Title,
        Tags(Vec<&'a str>),
        PropertiesOpen,
        PropertiesClose,
        Property { keyword: &'a str, value: &'a str },
        Comment,
        Text,
        Whitespace,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Token<'a> {
        pub kind: TokenKind<'a>,
        /// Source slice; excludes indentation and the line terminator.
        pub text: &'a str,
        pub range: SourceRange,
        pub line: usize,
        pub column: usize,
    }

    impl Token<'_> {
        pub fn is_trivia(&self) -> bool {
            matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
        }

        /// Column just past the token.
        pub fn end_column(&self) -> usize {
            self.column + self.text.chars().count()
        }
    }

    /// All tokens, trivia included, in source order.
    pub fn tokenize(text: &str) -> Vec<Token<'_>> {
        let mut out = Vec::new();
        // ranges stay relative to the caller's buffer, BOM included
        let (mut line_start, text) = match text.strip_prefix('\u{feff}') {
            Some(rest) => ('\u{feff}'.len_utf8(), rest),
            None => (0, text),
        };
        for (idx, raw) in text.split_inclusive('\n').enumerate() {
            let body = raw.strip_suffix('\n').unwrap_or(raw);
            let body = body.strip_suffix('\r').unwrap_or(body);
            LineLexer {
                body,
                line: idx + 1,
                line_start,
                out: &mut out,
            }
            .lex();
            line_start += raw.len();
        }
        out
    }

    /// Tokens with whitespace trivia removed. Comments stay: at top level they
    /// are document nodes.
    pub fn structural_tokens(text: &str) -> Vec<Token<'_>> {
        tokenize(text)
            .into_iter()
            .filter(|t| t.kind != TokenKind::Whitespace)
            .collect()
    }

    struct LineLexer<'a, 'o> {
        body: &'a str,
        line: usize,
        line_start: usize,
        out: &'o mut Vec<Token<'a>>,
    }

    impl<'a> LineLexer<'a, '_> {
        fn lex(mut self) {
            let content = self.body.trim_start();
            if content.is_empty() {
                self.push(TokenKind::Whitespace, self.body);
                return;
            }
            if content.starts_with('#') {
                self.push(TokenKind::Comment, content);
                return;
            }
            if let Ok((after, stars)) = stars(content) {
                self.push(TokenKind::Stars, stars);
                self.lex_headline(after);
                return;
            }
            let kind = match content.trim_end() {
                ":PROPERTIES:" => TokenKind::PropertiesOpen,
                ":END:" => TokenKind::PropertiesClose,
                _ => match property_line(content) {
                    Ok((_, (keyword, value))) => TokenKind::Property { keyword, value },
                    Err(_) => TokenKind::Text,
                },
            };
            self.push(kind, content);
        }

        fn lex_headline(&mut self, after_stars: &'a str) {
            let mut cursor = skip_spaces(after_stars);
            if let Ok((after, prio)) = priority(cursor) {
                self.push(TokenKind::Priority(prio), &cursor[..cursor.len() - after.len()]);
                cursor = skip_spaces(after);
            }

            let Ok((after, kw)) = keyword(cursor) else {
                let remainder = cursor.trim_end();
                if !remainder.is_empty() {
                    self.push(TokenKind::Text, remainder);
                }
                return;
            };
            self.push(TokenKind::Keyword(kw), &cursor[..cursor.len() - after.len()]);

            let line = skip_spaces(after).trim_end();
            // earliest suffix that starts a word and is a complete tag block
            let tagged = line
                .char_indices()
                .filter(|&(idx, _)| idx == 0 || line[..idx].ends_with(char::is_whitespace))
                .find_map(|(idx, _)| tag_block(&line[idx..]).ok().map(|(_, tags)| (idx, tags)));
            match tagged {
                Some((idx, tags)) => {
                    self.push(TokenKind::Title, line[..idx].trim_end());
                    self.push(TokenKind::Tags(tags), &line[idx..]);
                }
                None => self.push(TokenKind::Title, line),
            }
        }

        fn push(&mut self, kind: TokenKind<'a>, text: &'a str) {
            let at = self.body.offset(text);
            let start = self.line_start + at;
            self.out.push(Token {
                kind,
                text,
                range: SourceRange {
                    start,
                    end: start + text.len(),
                },
                line: self.line,
                column: self.body[..at].chars().count() + 1,
            });
        }
    }

    /* ----------------------------- Recognizers ----------------------------- */

    type LResult<'a, T> = IResult<&'a str, T>;

    fn skip_spaces(i: &str) -> &str {
        match space0::<_, nom::error::Error<&str>>(i) {
            Ok((rest, _)) => rest,
            Err(_) => i,
        }
    }

    fn stars(i: &str) -> LResult<'_, &str> {
        take_while1(|c: char| c == '*')(i)
    }

    fn priority(i: &str) -> LResult<'_, Priority> {
        delimited(
            tag("[#"),
            alt((
                value(Priority::A, char('A')),
                value(Priority::B, char('B')),
                value(Priority::C, char('C')),
            )),
            char(']'),
        )(i)
    }

    /// Whole-word keyword: must be followed by blanks or the end of the line.
    fn keyword(i: &str) -> LResult<'_, Keyword> {
        terminated(
            alt((
                value(Keyword::Todo, tag("TODO")),
                value(Keyword::InProgress, tag("INPROGRESS")),
                value(Keyword::Done, tag("DONE")),
                value(Keyword::Kill, tag("KILL")),
            )),
            peek(alt((space1, eof))),
        )(i)
    }

    /// `:a:b:` with at least one tag and no empty ones.
    fn tag_block(i: &str) -> LResult<'_, Vec<&str>> {
        all_consuming(delimited(
            char(':'),
            separated_list1(char(':'), take_while1(|c: char| c != ':')),
            char(':'),
        ))(i)
    }

    fn property_line(i: &str) -> LResult<'_, (&str, &str)> {
        tuple((
            delimited(
                char(':'),
                take_while1(|c: char| c.is_ascii_uppercase()),
                char(':'),
            ),
            rest,
        ))(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn kinds<'a>(tokens: &[Token<'a>]) -> Vec<TokenKind<'a>> {
            tokens.iter().map(|t| t.kind.clone()).collect()
        }

        #[test]
        fn full_headline_line() {
            let toks = tokenize("** [#A] TODO Buy milk :errand:home:");
            assert_eq!(
                kinds(&toks),
                vec![
                    TokenKind::Stars,
                    TokenKind::Priority(Priority::A),
                    TokenKind::Keyword(Keyword::Todo),
                    TokenKind::Title,
                    TokenKind::Tags(vec!["errand", "home"]),
                ]
            );
            assert_eq!(toks[0].text, "**");
            assert_eq!(toks[3].text, "Buy milk");
            assert_eq!(toks[3].column, 14);
            assert_eq!(toks[4].range, SourceRange { start: 22, end: 35 });
        }

        #[test]
        fn stars_without_keyword_leave_text() {
            let toks = tokenize("** Hello\n");
            assert_eq!(kinds(&toks), vec![TokenKind::Stars, TokenKind::Text]);
            assert_eq!(toks[1].text, "Hello");
            assert_eq!((toks[1].line, toks[1].column), (1, 4));
        }

        #[test]
        fn malformed_priority_is_not_consumed() {
            let toks = tokenize("* [#Z] TODO x");
            assert_eq!(kinds(&toks), vec![TokenKind::Stars, TokenKind::Text]);
            assert_eq!(toks[1].text, "[#Z] TODO x");
        }

        #[test]
        fn keyword_must_be_whole_word() {
            let toks = tokenize("* TODOS later");
            assert_eq!(kinds(&toks), vec![TokenKind::Stars, TokenKind::Text]);

            let toks = tokenize("* DONE");
            assert_eq!(
                kinds(&toks),
                vec![
                    TokenKind::Stars,
                    TokenKind::Keyword(Keyword::Done),
                    TokenKind::Title
                ]
            );
            assert_eq!(toks[2].text, "");
        }

        #[test]
        fn tags_only_at_end_of_line() {
            let toks = tokenize("* KILL ratio :a:b: was wrong");
            assert_eq!(toks.last().map(|t| t.kind.clone()), Some(TokenKind::Title));
            assert_eq!(toks[2].text, "ratio :a:b: was wrong");
        }

        #[test]
        fn empty_or_unterminated_tag_block_is_title() {
            for line in ["* TODO x ::", "* TODO x :a::", "* TODO x :a", "* TODO x :"] {
                let toks = tokenize(line);
                assert_eq!(toks.last().map(|t| &t.kind), Some(&TokenKind::Title), "{line}");
            }
        }

        #[test]
        fn tags_may_contain_spaces() {
            let toks = tokenize("* TODO x :my tag:");
            assert_eq!(toks[2].text, "x");
            assert_eq!(toks[3].kind, TokenKind::Tags(vec!["my tag"]));
            assert_eq!(toks[3].text, ":my tag:");
            assert_eq!(toks[3].column, 10);
        }

        #[test]
        fn tag_block_must_start_a_word() {
            let toks = tokenize("* TODO meet at 10:30 :work:");
            assert_eq!(toks[2].text, "meet at 10:30");
            assert_eq!(toks[3].kind, TokenKind::Tags(vec!["work"]));
        }

        #[test]
        fn leading_bom_is_skipped() {
            let toks = tokenize("\u{feff}* TODO a\n");
            assert_eq!(toks[0].kind, TokenKind::Stars);
            assert_eq!((toks[0].line, toks[0].column), (1, 1));
            assert_eq!(toks[0].range, SourceRange { start: 3, end: 4 });
        }

        #[test]
        fn tags_alone_give_empty_title() {
            let toks = tokenize("* TODO :solo:");
            assert_eq!(toks[2].kind, TokenKind::Title);
            assert_eq!(toks[2].text, "");
            assert_eq!(toks[3].kind, TokenKind::Tags(vec!["solo"]));
        }

        #[test]
        fn drawer_lines() {
            let toks = tokenize(":PROPERTIES:\n:ID: 123\n:END:\n:lower: x\n:A1:x\n");
            assert_eq!(
                kinds(&toks),
                vec![
                    TokenKind::PropertiesOpen,
                    TokenKind::Property {
                        keyword: "ID",
                        value: " 123"
                    },
                    TokenKind::PropertiesClose,
                    TokenKind::Text,
                    TokenKind::Text,
                ]
            );
        }

        #[test]
        fn property_value_may_be_empty() {
            let toks = tokenize(":EMPTY:");
            assert_eq!(
                toks[0].kind,
                TokenKind::Property {
                    keyword: "EMPTY",
                    value: ""
                }
            );
        }

        #[test]
        fn trivia_keeps_positions() {
            let toks = tokenize("# note\n\n  * TODO x\r\n");
            assert_eq!(toks[0].kind, TokenKind::Comment);
            assert!(toks[0].is_trivia());
            assert_eq!(toks[1].kind, TokenKind::Whitespace);
            assert_eq!(toks[1].line, 2);
            assert_eq!((toks[2].line, toks[2].column), (3, 3));
            assert_eq!(toks[2].range.start, 10);
            assert_eq!(toks[4].text, "x");

            let structural = structural_tokens("# note\n\n  * TODO x\r\n");
            assert_eq!(structural.len(), 4);
            assert!(structural.iter().all(|t| t.kind != TokenKind::Whitespace));
        }

        #[test]
        fn columns_count_chars() {
            let toks = tokenize("* TODO héllo wörld :tåg:");
            let tags = toks.last().unwrap();
            assert_eq!(tags.column, 20);
            assert_eq!(tags.end_column(), 25);
        }

        #[test]
        fn hash_inside_title_is_not_a_comment() {
            let toks = tokenize("* TODO fix issue #12");
            assert_eq!(toks[2].text, "fix issue #12");
            assert!(!toks.iter().any(|t| t.kind == TokenKind::Comment));
        }
    }
}

pub mod parser {
    //! Recursive-descent parser over `lexer::structural_tokens`.
    //!
    //! One rule function per production:
    //! `document -> (headline | comment)*`,
    //! `headline -> stars priority? keyword title tags? content?`,
    //! `content -> drawer | body`, `drawer -> open property* close`.
    //! The first violation aborts the parse; there is no recovery.

    use crate::core::*;
    use crate::lexer::{Token, TokenKind, structural_tokens};
    use tracing::{debug, instrument, trace};

    /// Parse a complete buffer into a `Document`.
    #[instrument(level = "debug", skip_all, fields(bytes = text.len()))]
    pub fn parse(text: &str) -> Result<Document, SyntaxError> {
        let tokens = structural_tokens(text);
        let document = Parser {
            tokens: &tokens,
            pos: 0,
        }
        .document()?;
        debug!(nodes = document.nodes.len(), "parsed document");
        Ok(document)
    }

    fn error(kind: ErrorKind, at: &Token<'_>) -> SyntaxError {
        SyntaxError {
            kind,
            line: at.line,
            column: at.column,
            offset: at.range.start,
        }
    }

    struct Parser<'t, 'a> {
        tokens: &'t [Token<'a>],
        pos: usize,
    }

    impl<'t, 'a> Parser<'t, 'a> {
        fn peek(&self) -> Option<&'t Token<'a>> {
            self.tokens.get(self.pos)
        }

        fn bump(&mut self) -> Option<&'t Token<'a>> {
            let tok = self.peek()?;
            self.pos += 1;
            Some(tok)
        }

        /// Consume the next token if it sits on `line` and `accept` takes its kind.
        fn eat_on_line<T>(
            &mut self,
            line: usize,
            accept: impl Fn(&'t TokenKind<'a>) -> Option<T>,
        ) -> Option<(&'t Token<'a>, T)> {
            let tok = self.peek().filter(|t| t.line == line)?;
            let out = accept(&tok.kind)?;
            self.pos += 1;
            Some((tok, out))
        }

        /* ------------------------------ Rules ------------------------------ */

        fn document(&mut self) -> Result<Document, SyntaxError> {
            let mut nodes = Vec::new();
            while let Some(tok) = self.bump() {
                let node = match tok.kind {
                    TokenKind::Stars => Node::Headline(self.headline(tok)?),
                    TokenKind::Comment => Node::Comment(comment(tok)),
                    TokenKind::PropertiesOpen => return Err(self.orphan_drawer(tok)),
                    _ => return Err(error(ErrorKind::UnexpectedToken, tok)),
                };
                nodes.push(node);
            }
            Ok(Document { nodes })
        }

        fn headline(&mut self, stars: &'t Token<'a>) -> Result<Headline, SyntaxError> {
            let line = stars.line;
            let mut last = stars;

            let mut priority = None;
            if let Some((tok, p)) = self.eat_on_line(line, |kind| match kind {
                TokenKind::Priority(p) => Some(*p),
                _ => None,
            }) {
                last = tok;
                priority = Some(p);
            }

            let keyword = match self.eat_on_line(line, |kind| match kind {
                TokenKind::Keyword(k) => Some(*k),
                _ => None,
            }) {
                Some((tok, k)) => {
                    last = tok;
                    k
                }
                None => {
                    return Err(match self.peek().filter(|t| t.line == line) {
                        Some(other) => error(ErrorKind::MissingKeyword, other),
                        None => SyntaxError {
                            kind: ErrorKind::MissingKeyword,
                            line,
                            column: last.end_column(),
                            offset: last.range.end,
                        },
                    });
                }
            };

            let mut title = String::new();
            if let Some((tok, ())) = self.eat_on_line(line, |kind| {
                matches!(kind, TokenKind::Title).then_some(())
            }) {
                last = tok;
                title = tok.text.to_string();
            }

            let mut tags = None;
            if let Some((tok, found)) = self.eat_on_line(line, |kind| match kind {
                TokenKind::Tags(found) => Some(found),
                _ => None,
            }) {
                last = tok;
                tags = Some(found.iter().map(|t| t.to_string()).collect());
            }

            let mut end = last.range.end;
            let mut comments = Vec::new();
            let content = match self.content(&mut comments)? {
                Some((content, content_end)) => {
                    end = content_end;
                    Some(content)
                }
                None => None,
            };

            trace!(depth = stars.text.len(), %keyword, %title, "headline");
            Ok(Headline {
                level: stars.text.len(),
                priority,
                keyword,
                title,
                tags,
                content,
                comments,
                range: SourceRange {
                    start: stars.range.start,
                    end,
                },
            })
        }

        /// Optional drawer or body after the headline line. Comments before the
        /// block go to `comments`; if no block follows they are left for the
        /// document.
        fn content(
            &mut self,
            comments: &mut Vec<Comment>,
        ) -> Result<Option<(Content, usize)>, SyntaxError> {
            let resume = self.pos;
            while let Some(tok) = self.peek().filter(|t| t.kind == TokenKind::Comment) {
                comments.push(comment(tok));
                self.pos += 1;
            }

            match self.peek() {
                Some(tok) if tok.kind == TokenKind::PropertiesOpen => {
                    self.pos += 1;
                    let (drawer, end) = self.drawer(tok, comments)?;
                    Ok(Some((Content::Properties(drawer), end)))
                }
                Some(tok) if starts_body(tok) => {
                    self.pos += 1;
                    trace!(line = tok.line, "body");
                    let body = Body {
                        text: tok.text.to_string(),
                    };
                    Ok(Some((Content::Body(body), tok.range.end)))
                }
                _ => {
                    self.pos = resume;
                    comments.clear();
                    Ok(None)
                }
            }
        }

        /// Entries up to `:END:`; `open` is the already consumed open marker.
        fn drawer(
            &mut self,
            open: &'t Token<'a>,
            comments: &mut Vec<Comment>,
        ) -> Result<(PropertiesDrawer, usize), SyntaxError> {
            let mut properties = Vec::new();
            loop {
                let Some(tok) = self.peek() else {
                    return Err(error(ErrorKind::UnterminatedDrawer, open));
                };
                match &tok.kind {
                    TokenKind::Property { keyword, value } => properties.push(Property {
                        keyword: keyword.to_string(),
                        value: value.to_string(),
                    }),
                    TokenKind::PropertiesClose => {
                        self.pos += 1;
                        trace!(entries = properties.len(), "drawer");
                        return Ok((PropertiesDrawer { properties }, tok.range.end));
                    }
                    TokenKind::Comment => comments.push(comment(tok)),
                    TokenKind::Stars => return Err(error(ErrorKind::UnterminatedDrawer, open)),
                    _ => return Err(error(ErrorKind::MalformedProperty, tok)),
                }
                self.pos += 1;
            }
        }

        /// A drawer with no owning headline is never valid; report its most
        /// specific defect.
        fn orphan_drawer(&mut self, open: &'t Token<'a>) -> SyntaxError {
            match self.drawer(open, &mut Vec::new()) {
                Err(e) => e,
                Ok(_) => error(ErrorKind::UnexpectedToken, open),
            }
        }
    }

    fn comment(tok: &Token<'_>) -> Comment {
        Comment {
            text: tok.text.strip_prefix('#').unwrap_or(tok.text).to_string(),
            range: tok.range,
        }
    }

    fn starts_body(tok: &Token<'_>) -> bool {
        matches!(
            tok.kind,
            TokenKind::Text | TokenKind::Property { .. } | TokenKind::PropertiesClose
        )
    }

}

pub mod query {
    //! Read-only navigation over a parsed `Document`.

    use crate::core::*;
    use indexmap::IndexMap;

    impl Document {
        pub fn headlines(&self) -> impl Iterator<Item = &Headline> {
            self.nodes.iter().filter_map(Node::as_headline)
        }

        /// Top-level comments only; see `Headline::comments` for the rest.
        pub fn comments(&self) -> impl Iterator<Item = &Comment> {
            self.nodes.iter().filter_map(Node::as_comment)
        }

        pub fn with_keyword(&self, keyword: Keyword) -> impl Iterator<Item = &Headline> {
            self.headlines().filter(move |h| h.keyword == keyword)
        }

        /// Headlines whose keyword does not close the task.
        pub fn open_tasks(&self) -> impl Iterator<Item = &Headline> {
            self.headlines().filter(|h| !h.keyword.is_done())
        }

        /// Tag -> headlines carrying it, keyed in order of first occurrence.
        pub fn tag_index(&self) -> IndexMap<&str, Vec<&Headline>> {
            let mut index: IndexMap<&str, Vec<&Headline>> = IndexMap::new();
            for h in self.headlines() {
                for tag in h.tags.iter().flatten() {
                    let entry = index.entry(tag.as_str()).or_default();
                    // a headline may repeat a tag
                    if !entry.last().is_some_and(|last| std::ptr::eq(*last, h)) {
                        entry.push(h);
                    }
                }
            }
            index
        }
    }

    impl Headline {
        pub fn has_tag(&self, tag: &str) -> bool {
            self.tags.iter().flatten().any(|t| t == tag)
        }

        pub fn properties(&self) -> &[Property] {
            match &self.content {
                Some(Content::Properties(drawer)) => &drawer.properties,
                _ => &[],
            }
        }

        /// First property named `keyword`.
        pub fn property(&self, keyword: &str) -> Option<&str> {
            self.properties()
                .iter()
                .find(|p| p.keyword == keyword)
                .map(|p| p.value.as_str())
        }

        pub fn body(&self) -> Option<&str> {
            match &self.content {
                Some(Content::Body(body)) => Some(body.text.as_str()),
                _ => None,
            }
        }
    }

}

pub use crate::core::{Document, SyntaxError};
pub use parser::parse;
