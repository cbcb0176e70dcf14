//! Core domain types, the filter expression engine, and change events.

pub mod types {
    use std::collections::BTreeMap;
    use std::fmt;
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::{Map, Value};

    pub type SequenceNumber = u64;

    /// Maximum length of a fallback log title before it is cut with `...`.
    pub const TITLE_LIMIT: usize = 200;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Protocol {
        #[serde(rename = "http:", alias = "http")]
        Http,
        #[serde(rename = "https:", alias = "https")]
        Https,
        #[serde(rename = "grpc:", alias = "grpc")]
        Grpc,
        #[serde(rename = "mongo:", alias = "mongo")]
        Mongo,
        #[serde(rename = "redis:", alias = "redis")]
        Redis,
        #[serde(rename = "sql:", alias = "sql")]
        Sql,
        #[serde(rename = "tcp:", alias = "tcp")]
        Tcp,
        #[serde(rename = "log:", alias = "log")]
        Log,
        #[serde(rename = "browser:", alias = "browser")]
        Browser,
    }

    impl Protocol {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Http => "http:",
                Self::Https => "https:",
                Self::Grpc => "grpc:",
                Self::Mongo => "mongo:",
                Self::Redis => "redis:",
                Self::Sql => "sql:",
                Self::Tcp => "tcp:",
                Self::Log => "log:",
                Self::Browser => "browser:",
            }
        }

        pub fn is_log(self) -> bool {
            self == Self::Log
        }
    }

    impl fmt::Display for Protocol {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Response payload: raw text or a decoded JSON object.
    #[derive(Clone, Debug, PartialEq)]
    pub enum ResponseBody {
        Text(String),
        Structured(Map<String, Value>),
    }

    impl Default for ResponseBody {
        fn default() -> Self {
            Self::Text(String::new())
        }
    }

    impl ResponseBody {
        pub fn as_structured(&self) -> Option<&Map<String, Value>> {
            match self {
                Self::Structured(map) => Some(map),
                Self::Text(_) => None,
            }
        }

        /// Resolve a dotted field path (`kubernetes.pod`) in a structured body.
        pub fn field(&self, path: &str) -> Option<&Value> {
            let map = self.as_structured()?;
            lookup_path(map, path)
        }

        pub fn to_search_string(&self) -> String {
            match self {
                Self::Text(text) => text.clone(),
                Self::Structured(map) => {
                    serde_json::to_string(map).unwrap_or_default()
                }
            }
        }
    }

    impl From<Value> for ResponseBody {
        fn from(value: Value) -> Self {
            match value {
                Value::Object(map) => Self::Structured(map),
                Value::String(text) => Self::Text(text),
                Value::Null => Self::Text(String::new()),
                other => Self::Text(other.to_string()),
            }
        }
    }

    impl Serialize for ResponseBody {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self {
                Self::Text(text) => serializer.serialize_str(text),
                Self::Structured(map) => map.serialize(serializer),
            }
        }
    }

    impl<'de> Deserialize<'de> for ResponseBody {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            Value::deserialize(deserializer).map(Self::from)
        }
    }

    pub fn lookup_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
        if let Some(value) = map.get(path) {
            return Some(value);
        }
        let mut segments = path.split('.');
        let mut current = map.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// One captured protocol exchange.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Message {
        pub sequence_number: SequenceNumber,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub sequence_number_response: Option<SequenceNumber>,
        pub protocol: Protocol,
        #[serde(default, rename = "clientIp", skip_serializing_if = "Option::is_none")]
        pub client_identity: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub method: Option<String>,
        #[serde(default)]
        pub path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub status: Option<u16>,
        #[serde(default, deserialize_with = "deserialize_headers")]
        pub request_headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        pub request_body: Value,
        #[serde(default)]
        pub response_body: ResponseBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub elapsed_time: Option<u64>,
    }

    impl Message {
        pub fn new(sequence_number: SequenceNumber, protocol: Protocol) -> Self {
            Self {
                sequence_number,
                sequence_number_response: None,
                protocol,
                client_identity: None,
                method: None,
                path: String::new(),
                status: None,
                request_headers: BTreeMap::new(),
                request_body: Value::Null,
                response_body: ResponseBody::default(),
                elapsed_time: None,
            }
        }

        /// A `log:` message: non-JSON prefix in `path`, payload in the body.
        pub fn log_line(sequence_number: SequenceNumber, prefix: &str, body: ResponseBody) -> Self {
            Self::new(sequence_number, Protocol::Log).with_path(prefix).with_body(body)
        }

        pub fn with_path(mut self, path: impl Into<String>) -> Self {
            self.path = path.into();
            self
        }

        pub fn with_method(mut self, method: impl Into<String>) -> Self {
            self.method = Some(method.into());
            self
        }

        pub fn with_client(mut self, client: impl Into<String>) -> Self {
            self.client_identity = Some(client.into());
            self
        }

        pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.request_headers.insert(name.into(), value.into());
            self
        }

        pub fn with_body(mut self, body: ResponseBody) -> Self {
            self.response_body = body;
            self
        }

        pub fn with_response(mut self, sequence_number: SequenceNumber, status: u16) -> Self {
            self.sequence_number_response = Some(sequence_number);
            self.status = Some(status);
            self
        }

        pub fn header(&self, name: &str) -> Option<&str> {
            self.request_headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }

        /// Flattened text every filter term is evaluated against.
        pub fn search_text(&self) -> String {
            fn push_token(out: &mut String, is_first: &mut bool, token: &str) {
                if token.is_empty() {
                    return;
                }
                if !*is_first {
                    out.push(' ');
                } else {
                    *is_first = false;
                }
                out.push_str(token);
            }

            let body = self.response_body.to_search_string();
            let mut search_text = String::with_capacity(self.path.len() + body.len() + 64);
            let mut is_first = true;
            push_token(&mut search_text, &mut is_first, self.protocol.as_str());
            if let Some(method) = self.method.as_deref() {
                push_token(&mut search_text, &mut is_first, method);
            }
            push_token(&mut search_text, &mut is_first, &self.path);
            if let Some(status) = self.status {
                push_token(&mut search_text, &mut is_first, &status.to_string());
            }
            for (name, value) in &self.request_headers {
                push_token(&mut search_text, &mut is_first, &format!("{name}: {value}"));
            }
            if !self.request_body.is_null() {
                push_token(&mut search_text, &mut is_first, &self.request_body.to_string());
            }
            push_token(&mut search_text, &mut is_first, &body);
            search_text
        }
    }

    fn deserialize_headers<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?;
        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(text) => (name, text),
                other => (name, other.to_string()),
            })
            .collect())
    }

    /// Classification of a `log:` message.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LogEntry {
        pub date: String,
        pub level: String,
        pub category: String,
        pub message: String,
    }

    impl LogEntry {
        pub fn is_empty(&self) -> bool {
            self.date.is_empty()
                && self.level.is_empty()
                && self.category.is_empty()
                && self.message.is_empty()
        }
    }

    /// Per-collection display state wrapping one captured message.
    #[derive(Clone, Debug)]
    pub struct MessageView {
        message: Arc<Message>,
        title: String,
        color: &'static str,
        log_entry: Option<LogEntry>,
        search_text: String,
        search_text_lower: String,
    }

    impl MessageView {
        pub fn new(message: Arc<Message>, color: &'static str) -> Self {
            let search_text = message.search_text();
            let search_text_lower = search_text.to_lowercase();
            let title = default_title(&message);
            Self { message, title, color, log_entry: None, search_text, search_text_lower }
        }

        pub fn message(&self) -> &Message {
            &self.message
        }

        pub fn shared_message(&self) -> Arc<Message> {
            Arc::clone(&self.message)
        }

        pub fn sequence_number(&self) -> SequenceNumber {
            self.message.sequence_number
        }

        pub fn protocol(&self) -> Protocol {
            self.message.protocol
        }

        pub fn title(&self) -> &str {
            &self.title
        }

        pub fn set_title(&mut self, title: String) {
            self.title = title;
        }

        pub fn color(&self) -> &'static str {
            self.color
        }

        pub fn log_entry(&self) -> Option<&LogEntry> {
            self.log_entry.as_ref()
        }

        pub fn set_log_entry(&mut self, entry: LogEntry) {
            self.log_entry = Some(entry);
        }

        pub fn search_text(&self) -> &str {
            &self.search_text
        }

        pub fn search_text_lower(&self) -> &str {
            &self.search_text_lower
        }
    }

    /// Title used before any field labels are applied.
    pub fn default_title(message: &Message) -> String {
        match (&message.protocol, &message.response_body) {
            (Protocol::Log, body) => fallback_log_title(&message.path, body),
            (_, _) => match message.method.as_deref() {
                Some(method) if !method.is_empty() => format!("{method} {}", message.path),
                _ => message.path.clone(),
            },
        }
    }

    /// `prefix + " " + body`, cut to [`TITLE_LIMIT`] characters.
    pub fn fallback_log_title(prefix: &str, body: &ResponseBody) -> String {
        let mut title = if prefix.is_empty() { String::new() } else { format!("{prefix} ") };
        title.push_str(&body.to_search_string());
        truncate(&title, TITLE_LIMIT)
    }

    pub fn truncate(value: &str, max_len: usize) -> String {
        if value.chars().count() <= max_len {
            return value.to_string();
        }
        let mut out: String = value.chars().take(max_len).collect();
        out.push_str("...");
        out
    }
}

pub mod filters {
    use std::collections::VecDeque;

    use memchr::memmem::Finder;
    #[cfg(feature = "rayon")]
    use rayon::prelude::*;
    use regex::{Regex, RegexBuilder};
    use thiserror::Error;

    use super::types::MessageView;

    #[cfg(feature = "rayon")]
    const PAR_FILTER_THRESHOLD: usize = 2048;

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    pub enum FilterError {
        #[error("unbalanced parentheses at offset {offset}")]
        UnbalancedParens { offset: usize },
        #[error("operator `{op}` is missing an operand")]
        DanglingOperator { op: &'static str },
        #[error("empty group at offset {offset}")]
        EmptyGroup { offset: usize },
        #[error("unexpected `{found}` at offset {offset}")]
        Unexpected { found: String, offset: usize },
        #[error("unterminated quote at offset {offset}")]
        UnterminatedQuote { offset: usize },
        #[error("invalid regex pattern `{pattern}`: {message}")]
        InvalidRegex { pattern: String, message: String },
    }

    /// A search, breakpoint, or no-capture rule.
    ///
    /// The expression is compiled whenever it or one of its flags changes, so
    /// [`FilterRule::matches`] only walks the compiled tree.
    #[derive(Clone, Debug)]
    pub struct FilterRule {
        expression: String,
        match_case: bool,
        use_regex: bool,
        use_logical: bool,
        enabled: bool,
        compiled: Compiled,
    }

    #[derive(Clone, Debug)]
    enum Compiled {
        Everything,
        Expr(Expr),
        Invalid(FilterError),
    }

    #[derive(Clone, Debug)]
    enum Expr {
        Term(Term),
        Not(Box<Expr>),
        And(Box<Expr>, Box<Expr>),
        Or(Box<Expr>, Box<Expr>),
    }

    #[derive(Clone, Debug)]
    enum Term {
        Substring { finder: Finder<'static>, match_case: bool },
        Regex(Regex),
    }

    impl Default for FilterRule {
        fn default() -> Self {
            Self::with_flags("", false, false, false)
        }
    }

    impl FilterRule {
        /// Plain, case-insensitive substring rule.
        pub fn new(expression: impl Into<String>) -> Self {
            Self::with_flags(expression, false, false, false)
        }

        pub fn with_flags(
            expression: impl Into<String>,
            match_case: bool,
            use_regex: bool,
            use_logical: bool,
        ) -> Self {
            let mut rule = Self {
                expression: expression.into(),
                match_case,
                use_regex,
                use_logical,
                enabled: false,
                compiled: Compiled::Everything,
            };
            rule.recompile();
            rule
        }

        pub fn logical(expression: impl Into<String>) -> Self {
            Self::with_flags(expression, false, false, true)
        }

        pub fn expression(&self) -> &str {
            &self.expression
        }

        pub fn match_case(&self) -> bool {
            self.match_case
        }

        pub fn use_regex(&self) -> bool {
            self.use_regex
        }

        pub fn use_logical(&self) -> bool {
            self.use_logical
        }

        pub fn is_enabled(&self) -> bool {
            self.enabled
        }

        pub fn set_expression(&mut self, expression: impl Into<String>) {
            self.expression = expression.into();
            self.recompile();
        }

        pub fn set_match_case(&mut self, match_case: bool) {
            self.match_case = match_case;
            self.recompile();
        }

        pub fn set_regex(&mut self, use_regex: bool) {
            self.use_regex = use_regex;
            self.recompile();
        }

        pub fn set_logical(&mut self, use_logical: bool) {
            self.use_logical = use_logical;
            self.recompile();
        }

        pub fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }

        pub fn is_empty(&self) -> bool {
            self.expression.trim().is_empty()
        }

        pub fn is_invalid(&self) -> bool {
            matches!(self.compiled, Compiled::Invalid(_))
        }

        pub fn error(&self) -> Option<&FilterError> {
            match &self.compiled {
                Compiled::Invalid(error) => Some(error),
                _ => None,
            }
        }

        pub fn matches(&self, view: &MessageView) -> bool {
            match &self.compiled {
                Compiled::Everything => true,
                Compiled::Expr(expr) => expr.eval(view),
                Compiled::Invalid(_) => false,
            }
        }

        /// True when the rule excludes the view.
        pub fn is_filtered(&self, view: &MessageView) -> bool {
            !self.matches(view)
        }

        /// Indices of matching views, in collection order.
        pub fn apply(&self, views: &VecDeque<MessageView>) -> Vec<usize> {
            #[cfg(feature = "rayon")]
            {
                if views.len() >= PAR_FILTER_THRESHOLD {
                    let matches: Vec<bool> = views.par_iter().map(|view| self.matches(view)).collect();
                    return matches
                        .into_iter()
                        .enumerate()
                        .filter_map(|(idx, is_match)| is_match.then_some(idx))
                        .collect();
                }
            }

            views
                .iter()
                .enumerate()
                .filter_map(|(idx, view)| self.matches(view).then_some(idx))
                .collect()
        }

        fn recompile(&mut self) {
            self.compiled = match self.compile() {
                Ok(compiled) => compiled,
                Err(error) => Compiled::Invalid(error),
            };
        }

        fn compile(&self) -> Result<Compiled, FilterError> {
            let trimmed = self.expression.trim();
            if trimmed.is_empty() {
                return Ok(Compiled::Everything);
            }

            if !self.use_logical {
                return Ok(Compiled::Expr(Expr::Term(self.compile_term(trimmed)?)));
            }

            let tokens = tokenize(&self.expression)?;
            let mut parser = Parser { tokens, pos: 0 };
            let ast = parser.parse_expression()?;
            if let Some(spanned) = parser.tokens.get(parser.pos) {
                return Err(match &spanned.token {
                    Token::RParen => FilterError::UnbalancedParens { offset: spanned.offset },
                    other => FilterError::Unexpected {
                        found: other.describe(),
                        offset: spanned.offset,
                    },
                });
            }
            Ok(Compiled::Expr(self.lower(ast)?))
        }

        fn lower(&self, ast: Ast) -> Result<Expr, FilterError> {
            Ok(match ast {
                Ast::Term(text) => Expr::Term(self.compile_term(&text)?),
                Ast::Not(inner) => Expr::Not(Box::new(self.lower(*inner)?)),
                Ast::And(left, right) => {
                    Expr::And(Box::new(self.lower(*left)?), Box::new(self.lower(*right)?))
                }
                Ast::Or(left, right) => {
                    Expr::Or(Box::new(self.lower(*left)?), Box::new(self.lower(*right)?))
                }
            })
        }

        fn compile_term(&self, text: &str) -> Result<Term, FilterError> {
            if self.use_regex {
                let regex = RegexBuilder::new(text)
                    .case_insensitive(!self.match_case)
                    .build()
                    .map_err(|error| FilterError::InvalidRegex {
                        pattern: text.to_string(),
                        message: error.to_string(),
                    })?;
                return Ok(Term::Regex(regex));
            }

            let needle = if self.match_case { text.to_string() } else { text.to_lowercase() };
            Ok(Term::Substring {
                finder: Finder::new(needle.as_bytes()).into_owned(),
                match_case: self.match_case,
            })
        }
    }

    impl Expr {
        fn eval(&self, view: &MessageView) -> bool {
            match self {
                Self::Term(term) => term.eval(view),
                Self::Not(inner) => !inner.eval(view),
                Self::And(left, right) => left.eval(view) && right.eval(view),
                Self::Or(left, right) => left.eval(view) || right.eval(view),
            }
        }
    }

    impl Term {
        fn eval(&self, view: &MessageView) -> bool {
            match self {
                Self::Substring { finder, match_case } => {
                    let haystack =
                        if *match_case { view.search_text() } else { view.search_text_lower() };
                    finder.find(haystack.as_bytes()).is_some()
                }
                Self::Regex(regex) => regex.is_match(view.search_text()),
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Token {
        And,
        Or,
        Not,
        LParen,
        RParen,
        Term(String),
    }

    impl Token {
        fn describe(&self) -> String {
            match self {
                Self::And => "&&".to_string(),
                Self::Or => "||".to_string(),
                Self::Not => "!".to_string(),
                Self::LParen => "(".to_string(),
                Self::RParen => ")".to_string(),
                Self::Term(text) => text.clone(),
            }
        }

        fn operator_name(&self) -> Option<&'static str> {
            match self {
                Self::And => Some("&&"),
                Self::Or => Some("||"),
                Self::Not => Some("!"),
                _ => None,
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Spanned {
        token: Token,
        offset: usize,
    }

    #[derive(Debug)]
    enum Ast {
        Term(String),
        Not(Box<Ast>),
        And(Box<Ast>, Box<Ast>),
        Or(Box<Ast>, Box<Ast>),
    }

    fn tokenize(input: &str) -> Result<Vec<Spanned>, FilterError> {
        fn flush(tokens: &mut Vec<Spanned>, buffer: &mut String, start: &mut Option<usize>) {
            let trimmed = buffer.trim();
            if !trimmed.is_empty() {
                tokens.push(Spanned {
                    token: Token::Term(trimmed.to_string()),
                    offset: start.unwrap_or(0),
                });
            }
            buffer.clear();
            *start = None;
        }

        let mut tokens = Vec::new();
        let mut buffer = String::new();
        let mut start: Option<usize> = None;
        let mut chars = input.char_indices().peekable();

        while let Some((offset, ch)) = chars.next() {
            match ch {
                '&' if chars.peek().map(|(_, next)| *next) == Some('&') => {
                    chars.next();
                    flush(&mut tokens, &mut buffer, &mut start);
                    tokens.push(Spanned { token: Token::And, offset });
                }
                '|' if chars.peek().map(|(_, next)| *next) == Some('|') => {
                    chars.next();
                    flush(&mut tokens, &mut buffer, &mut start);
                    tokens.push(Spanned { token: Token::Or, offset });
                }
                '!' if buffer.trim().is_empty() => {
                    buffer.clear();
                    start = None;
                    tokens.push(Spanned { token: Token::Not, offset });
                }
                '(' => {
                    flush(&mut tokens, &mut buffer, &mut start);
                    tokens.push(Spanned { token: Token::LParen, offset });
                }
                ')' => {
                    flush(&mut tokens, &mut buffer, &mut start);
                    tokens.push(Spanned { token: Token::RParen, offset });
                }
                '"' => {
                    flush(&mut tokens, &mut buffer, &mut start);
                    let mut literal = String::new();
                    let mut closed = false;
                    while let Some((_, next)) = chars.next() {
                        match next {
                            '\\' => {
                                if let Some((_, escaped)) = chars.next() {
                                    literal.push(escaped);
                                }
                            }
                            '"' => {
                                closed = true;
                                break;
                            }
                            other => literal.push(other),
                        }
                    }
                    if !closed {
                        return Err(FilterError::UnterminatedQuote { offset });
                    }
                    if literal.is_empty() {
                        return Err(FilterError::Unexpected { found: "\"\"".to_string(), offset });
                    }
                    tokens.push(Spanned { token: Token::Term(literal), offset });
                }
                other => {
                    if start.is_none() && !other.is_whitespace() {
                        start = Some(offset);
                    }
                    buffer.push(other);
                }
            }
        }
        flush(&mut tokens, &mut buffer, &mut start);
        Ok(tokens)
    }

    struct Parser {
        tokens: Vec<Spanned>,
        pos: usize,
    }

    impl Parser {
        fn current(&self) -> Option<&Token> {
            self.tokens.get(self.pos).map(|spanned| &spanned.token)
        }

        fn offset(&self) -> usize {
            self.tokens.get(self.pos).map(|spanned| spanned.offset).unwrap_or_else(|| {
                self.tokens.last().map(|spanned| spanned.offset + 1).unwrap_or(0)
            })
        }

        fn previous_operator(&self) -> Option<&'static str> {
            self.pos
                .checked_sub(1)
                .and_then(|idx| self.tokens.get(idx))
                .and_then(|spanned| spanned.token.operator_name())
        }

        fn parse_expression(&mut self) -> Result<Ast, FilterError> {
            self.parse_or()
        }

        fn parse_or(&mut self) -> Result<Ast, FilterError> {
            let mut left = self.parse_and()?;
            while matches!(self.current(), Some(Token::Or)) {
                self.pos += 1;
                let right = self.parse_and()?;
                left = Ast::Or(Box::new(left), Box::new(right));
            }
            Ok(left)
        }

        fn parse_and(&mut self) -> Result<Ast, FilterError> {
            let mut left = self.parse_unary()?;
            while matches!(self.current(), Some(Token::And)) {
                self.pos += 1;
                let right = self.parse_unary()?;
                left = Ast::And(Box::new(left), Box::new(right));
            }
            Ok(left)
        }

        fn parse_unary(&mut self) -> Result<Ast, FilterError> {
            if matches!(self.current(), Some(Token::Not)) {
                self.pos += 1;
                let inner = self.parse_unary()?;
                return Ok(Ast::Not(Box::new(inner)));
            }
            self.parse_primary()
        }

        fn parse_primary(&mut self) -> Result<Ast, FilterError> {
            let offset = self.offset();
            match self.current().cloned() {
                Some(Token::Term(text)) => {
                    self.pos += 1;
                    Ok(Ast::Term(text))
                }
                Some(Token::LParen) => {
                    self.pos += 1;
                    if matches!(self.current(), Some(Token::RParen)) {
                        return Err(FilterError::EmptyGroup { offset });
                    }
                    let inner = self.parse_expression()?;
                    if !matches!(self.current(), Some(Token::RParen)) {
                        return Err(FilterError::UnbalancedParens { offset });
                    }
                    self.pos += 1;
                    Ok(inner)
                }
                Some(Token::And) | Some(Token::Or) if self.pos == 0 => {
                    let op = self.current().and_then(Token::operator_name).unwrap_or("&&");
                    Err(FilterError::DanglingOperator { op })
                }
                Some(other) => match self.previous_operator() {
                    Some(op) => Err(FilterError::DanglingOperator { op }),
                    None if other == Token::RParen => Err(FilterError::EmptyGroup { offset }),
                    None => Err(FilterError::Unexpected { found: other.describe(), offset }),
                },
                None => match self.previous_operator() {
                    Some(op) => Err(FilterError::DanglingOperator { op }),
                    None => Err(FilterError::UnbalancedParens { offset }),
                },
            }
        }
    }
}

pub mod events {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use tokio::sync::broadcast;

    use super::types::SequenceNumber;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Event {
        MessageCaptured { sequence_number: SequenceNumber },
        MessageHeld { sequence_number: SequenceNumber, breakpoint: usize },
        MessageDropped { sequence_number: SequenceNumber },
        QueueCleared,
        CaptureToggled { stopped: bool },
        SortChanged,
        FilterChanged,
        BreakpointsChanged,
        QueriesChanged,
        SnapshotCreated { name: String },
        SnapshotDeleted { name: String },
        SnapshotSelected { name: String },
        TitlesUpdated { name: String },
    }

    /// An event stamped with the state version it produced.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Change {
        pub version: u64,
        pub event: Event,
    }

    pub trait EventBus {
        type Error;
        type Subscription;

        fn emit(&self, event: Event) -> Result<u64, Self::Error>;
        fn subscribe(&self) -> Result<Self::Subscription, Self::Error>;
    }

    /// Broadcast change channel plus a monotonically increasing version.
    #[derive(Clone, Debug)]
    pub struct ChangeBus {
        sender: broadcast::Sender<Change>,
        version: Arc<AtomicU64>,
    }

    impl Default for ChangeBus {
        fn default() -> Self {
            Self::new(256)
        }
    }

    impl ChangeBus {
        pub fn new(capacity: usize) -> Self {
            let (sender, _) = broadcast::channel(capacity.max(1));
            Self { sender, version: Arc::new(AtomicU64::new(0)) }
        }

        pub fn version(&self) -> u64 {
            self.version.load(Ordering::Acquire)
        }
    }

    impl EventBus for ChangeBus {
        type Error = Infallible;
        type Subscription = broadcast::Receiver<Change>;

        fn emit(&self, event: Event) -> Result<u64, Self::Error> {
            let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
            // No subscribers is fine; readers may poll `version` instead.
            let _ = self.sender.send(Change { version, event });
            Ok(version)
        }

        fn subscribe(&self) -> Result<Self::Subscription, Self::Error> {
            Ok(self.sender.subscribe())
        }
    }
}

pub use events::{Change, ChangeBus, Event, EventBus};
pub use filters::{FilterError, FilterRule};
pub use types::{
    default_title, fallback_log_title, lookup_path, truncate, LogEntry, Message, MessageView,
    Protocol, ResponseBody, SequenceNumber, TITLE_LIMIT,
};
