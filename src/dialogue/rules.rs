//! Built-in interpreter for the line-oriented flow script dialect.
//!
//! ```text
//! ! var name = Ana
//! + hola
//! - ¡Hola! ¿En qué te puedo ayudar?
//!
//! + mi nombre es *
//! - <set name=<star>>Encantado, <star>.
//!
//! + (precio|precios) [por favor]
//! * <get name> != undefined => <get name>, nuestros precios están en la web.
//! - Nuestros precios están en la web.
//!
//! > topic soporte
//! + *
//! - Un agente te contactará pronto.{topic=random}
//! < topic
//! ```
//!
//! Triggers are matched against lowercased input with punctuation removed.
//! Inside a unit exact triggers go before wildcard triggers and longer
//! triggers before shorter ones; across units the merge order decides.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::seq::IndexedRandom;
use regex::{Captures, Regex};
use tracing::{trace, warn};

use super::{
    CompiledUnit, DEFAULT_TOPIC, DialogueInterpreter, DialogueSession, MatchInfo, Reply,
    SessionBuilder, TOPIC_VAR,
};
use crate::error::CompileError;

const MAX_REDIRECT_DEPTH: usize = 8;
const UNDEFINED: &str = "undefined";

static STAR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<star(\d*)>").expect("star tag regex"));
static BOT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<bot ([\w-]+)>").expect("bot tag regex"));
/// `<get name>` and `<set name=value>`, expanded left to right in one pass.
static VAR_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<get ([\w-]+)>|<set ([\w-]+)=([^<>]*)>").expect("variable tag regex")
});
static TOPIC_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{topic=([\w-]+)\}").expect("topic tag regex"));

#[derive(Debug, Default, Clone)]
pub struct RuleInterpreter;

impl RuleInterpreter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl DialogueInterpreter for RuleInterpreter {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn compile(&self, script: &str) -> Result<CompiledUnit, CompileError> {
        parse_script("", script).map(|unit| unit.summary())
    }

    fn builder(&self) -> Box<dyn SessionBuilder> {
        Box::new(RuleSessionBuilder::default())
    }
}

#[derive(Debug)]
struct Unit {
    id: String,
    rules: Vec<Rule>,
    bot_vars: HashMap<String, String>,
}

impl Unit {
    fn summary(&self) -> CompiledUnit {
        let mut topics: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !topics.contains(&rule.topic) {
                topics.push(rule.topic.clone());
            }
        }
        CompiledUnit {
            rule_count: self.rules.len(),
            wildcard_rules: self.rules.iter().filter(|r| r.wildcard).count(),
            topics,
        }
    }
}

#[derive(Debug)]
struct Rule {
    trigger: String,
    pattern: Regex,
    wildcard: bool,
    literal_words: usize,
    topic: String,
    replies: Vec<String>,
    conditions: Vec<Condition>,
    redirect: Option<String>,
}

#[derive(Debug)]
struct Condition {
    left: String,
    op: CmpOp,
    right: String,
    reply: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "==" | "eq" => Some(CmpOp::Eq),
            "!=" | "ne" | "<>" => Some(CmpOp::Ne),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Ge),
            _ => None,
        }
    }

    fn holds(self, left: &str, right: &str) -> bool {
        let (left, right) = (left.trim().to_lowercase(), right.trim().to_lowercase());
        match self {
            CmpOp::Eq => left == right,
            CmpOp::Ne => left != right,
            _ => match (left.parse::<f64>(), right.parse::<f64>()) {
                (Ok(l), Ok(r)) => match self {
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                    CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
                },
                _ => false,
            },
        }
    }
}

struct RuleDraft {
    line: usize,
    trigger: String,
    topic: String,
    replies: Vec<String>,
    conditions: Vec<Condition>,
    redirect: Option<String>,
}

#[derive(Clone, Copy)]
enum LastLine {
    None,
    Trigger,
    Reply,
    Condition,
    Redirect,
}

fn parse_script(unit_id: &str, script: &str) -> Result<Unit, CompileError> {
    let mut rules = Vec::new();
    let mut bot_vars = HashMap::new();
    let mut topic: Option<(String, usize)> = None;
    let mut draft: Option<RuleDraft> = None;
    let mut last = LastLine::None;
    let mut line_count = 0;

    for (idx, raw) in script.lines().enumerate() {
        let line_no = idx + 1;
        line_count = line_no;
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let mut chars = line.chars();
        let Some(cmd) = chars.next() else { continue };
        let body = chars.as_str().trim();

        match cmd {
            '!' => {
                parse_definition(line_no, body, &mut bot_vars)?;
                last = LastLine::None;
            }
            '>' => {
                let mut parts = body.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("topic"), Some(name)) => {
                        if let Some((open, _)) = &topic {
                            return Err(CompileError::new(
                                line_no,
                                format!("topic `{name}` opened inside topic `{open}`"),
                            ));
                        }
                        finish_draft(&mut draft, &mut rules)?;
                        topic = Some((name.to_lowercase(), line_no));
                    }
                    _ => {
                        return Err(CompileError::new(
                            line_no,
                            format!("unsupported block `> {body}`"),
                        ));
                    }
                }
                last = LastLine::None;
            }
            '<' => {
                if body != "topic" || topic.is_none() {
                    return Err(CompileError::new(line_no, "unbalanced topic block"));
                }
                finish_draft(&mut draft, &mut rules)?;
                topic = None;
                last = LastLine::None;
            }
            '+' => {
                finish_draft(&mut draft, &mut rules)?;
                if body.is_empty() {
                    return Err(CompileError::new(line_no, "empty trigger"));
                }
                draft = Some(RuleDraft {
                    line: line_no,
                    trigger: body.to_string(),
                    topic: topic
                        .as_ref()
                        .map(|(name, _)| name.clone())
                        .unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                    replies: Vec::new(),
                    conditions: Vec::new(),
                    redirect: None,
                });
                last = LastLine::Trigger;
            }
            '-' => {
                let current = open_draft(&mut draft, line_no, "reply")?;
                current.replies.push(body.to_string());
                last = LastLine::Reply;
            }
            '*' => {
                let condition = parse_condition(line_no, body)?;
                let current = open_draft(&mut draft, line_no, "condition")?;
                current.conditions.push(condition);
                last = LastLine::Condition;
            }
            '@' => {
                if body.is_empty() {
                    return Err(CompileError::new(line_no, "empty redirect"));
                }
                let current = open_draft(&mut draft, line_no, "redirect")?;
                current.redirect = Some(body.to_string());
                last = LastLine::Redirect;
            }
            '^' => {
                let current = open_draft(&mut draft, line_no, "continuation")?;
                let target = match last {
                    LastLine::Trigger => Some(&mut current.trigger),
                    LastLine::Reply => current.replies.last_mut(),
                    LastLine::Condition => current.conditions.last_mut().map(|c| &mut c.reply),
                    LastLine::Redirect => current.redirect.as_mut(),
                    LastLine::None => None,
                };
                let Some(target) = target else {
                    return Err(CompileError::new(
                        line_no,
                        "continuation without a line to continue",
                    ));
                };
                target.push(' ');
                target.push_str(body);
            }
            other => {
                return Err(CompileError::new(
                    line_no,
                    format!("unknown command `{other}`"),
                ));
            }
        }
    }

    finish_draft(&mut draft, &mut rules)?;
    if let Some((name, opened)) = topic {
        return Err(CompileError::new(
            line_count.max(opened),
            format!("topic `{name}` is never closed"),
        ));
    }

    // stable sort keeps script order between equally specific triggers
    rules.sort_by_key(|rule| (rule.wildcard, Reverse(rule.literal_words)));

    Ok(Unit {
        id: unit_id.to_string(),
        rules,
        bot_vars,
    })
}

fn open_draft<'a>(
    draft: &'a mut Option<RuleDraft>,
    line: usize,
    what: &str,
) -> Result<&'a mut RuleDraft, CompileError> {
    draft
        .as_mut()
        .ok_or_else(|| CompileError::new(line, format!("{what} without a trigger")))
}

fn parse_definition(
    line: usize,
    body: &str,
    bot_vars: &mut HashMap<String, String>,
) -> Result<(), CompileError> {
    let (kind, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    match kind {
        "version" => Ok(()),
        "var" | "global" => {
            let Some((name, value)) = rest.split_once('=') else {
                return Err(CompileError::new(line, "definition without `=`"));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(CompileError::new(line, "definition without a name"));
            }
            bot_vars.insert(name.to_string(), value.trim().to_string());
            Ok(())
        }
        other => Err(CompileError::new(
            line,
            format!("unsupported definition `{other}`"),
        )),
    }
}

fn parse_condition(line: usize, body: &str) -> Result<Condition, CompileError> {
    let Some((test, reply)) = body.split_once("=>") else {
        return Err(CompileError::new(line, "condition without `=>`"));
    };
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(CompileError::new(line, "condition without a reply"));
    }
    let tokens: Vec<&str> = test.split_whitespace().collect();
    let Some((pos, op)) = tokens
        .iter()
        .enumerate()
        .find_map(|(i, t)| CmpOp::parse(t).map(|op| (i, op)))
    else {
        return Err(CompileError::new(line, "condition without a comparison operator"));
    };
    let left = tokens[..pos].join(" ");
    let right = tokens[pos + 1..].join(" ");
    if left.is_empty() || right.is_empty() {
        return Err(CompileError::new(line, "condition is missing an operand"));
    }
    Ok(Condition {
        left,
        op,
        right,
        reply: reply.to_string(),
    })
}

fn finish_draft(draft: &mut Option<RuleDraft>, rules: &mut Vec<Rule>) -> Result<(), CompileError> {
    let Some(draft) = draft.take() else {
        return Ok(());
    };
    if draft.replies.is_empty() && draft.conditions.is_empty() && draft.redirect.is_none() {
        return Err(CompileError::new(
            draft.line,
            format!("trigger `{}` has no reply", draft.trigger),
        ));
    }
    rules.push(compile_rule(draft)?);
    Ok(())
}

enum Token {
    Word(String),
    Alternatives(Vec<String>),
    Optional(Vec<String>),
}

fn compile_rule(draft: RuleDraft) -> Result<Rule, CompileError> {
    let normalized = normalize_trigger(&draft.trigger);
    if normalized.is_empty() {
        return Err(CompileError::new(draft.line, "empty trigger"));
    }
    let tokens = tokenize(draft.line, &normalized)?;

    let mut pattern = String::from("^");
    let mut wildcard = false;
    let mut literal_words = 0;
    for token in &tokens {
        match token {
            Token::Word(word) => {
                let has_wildcard = word.chars().any(is_wildcard_char);
                wildcard |= has_wildcard;
                if !has_wildcard {
                    literal_words += 1;
                }
                pattern.push_str(r"\s+");
                pattern.push_str(&word_pattern(word));
            }
            Token::Alternatives(alts) => {
                literal_words += 1;
                pattern.push_str(r"\s+(");
                pattern.push_str(&alternatives_pattern(alts));
                pattern.push(')');
            }
            Token::Optional(alts) => {
                pattern.push_str(r"(?:\s+(?:");
                pattern.push_str(&alternatives_pattern(alts));
                pattern.push_str("))?");
            }
        }
    }
    pattern.push_str(r"\s*$");

    let regex = Regex::new(&pattern).map_err(|e| {
        CompileError::new(draft.line, format!("trigger `{}` cannot be compiled: {e}", draft.trigger))
    })?;

    Ok(Rule {
        trigger: draft.trigger,
        pattern: regex,
        wildcard,
        literal_words,
        topic: draft.topic,
        replies: draft.replies,
        conditions: draft.conditions,
        redirect: draft.redirect,
    })
}

fn is_wildcard_char(c: char) -> bool {
    matches!(c, '*' | '#' | '_')
}

fn word_pattern(word: &str) -> String {
    word.chars()
        .map(|c| match c {
            '*' => r"(.+?)".to_string(),
            '#' => r"(\d+)".to_string(),
            '_' => r"(\S+)".to_string(),
            other => regex::escape(&other.to_string()),
        })
        .collect()
}

fn alternatives_pattern(alts: &[String]) -> String {
    alts.iter()
        .map(|alt| {
            alt.split_whitespace()
                .map(|word| {
                    word.chars()
                        .map(|c| match c {
                            '*' => r".+?".to_string(),
                            '#' => r"\d+".to_string(),
                            '_' => r"\S+".to_string(),
                            other => regex::escape(&other.to_string()),
                        })
                        .collect::<String>()
                })
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn tokenize(line: usize, trigger: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut chars = trigger.chars();

    while let Some(c) = chars.next() {
        match c {
            '(' | '[' => {
                flush_word(&mut word, &mut tokens);
                let close = if c == '(' { ')' } else { ']' };
                let mut inner = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == close {
                        closed = true;
                        break;
                    }
                    if matches!(n, '(' | '[' | ')' | ']') {
                        return Err(CompileError::new(line, "nested or mismatched brackets in trigger"));
                    }
                    inner.push(n);
                }
                if !closed {
                    return Err(CompileError::new(line, format!("unclosed `{c}` in trigger")));
                }
                let alts: Vec<String> = inner
                    .split('|')
                    .map(|a| a.split_whitespace().collect::<Vec<_>>().join(" "))
                    .filter(|a| !a.is_empty())
                    .collect();
                if alts.is_empty() {
                    return Err(CompileError::new(line, "empty group in trigger"));
                }
                tokens.push(if c == '(' {
                    Token::Alternatives(alts)
                } else {
                    Token::Optional(alts)
                });
            }
            ')' | ']' => {
                return Err(CompileError::new(line, format!("unbalanced `{c}` in trigger")));
            }
            c if c.is_whitespace() => flush_word(&mut word, &mut tokens),
            other => word.push(other),
        }
    }
    flush_word(&mut word, &mut tokens);
    Ok(tokens)
}

fn flush_word(word: &mut String, tokens: &mut Vec<Token>) {
    if !word.is_empty() {
        tokens.push(Token::Word(std::mem::take(word)));
    }
}

fn normalize_trigger(trigger: &str) -> String {
    trigger
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || "*#_()[]|".contains(*c))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_input(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Default)]
struct RuleSessionBuilder {
    units: Vec<Unit>,
}

impl SessionBuilder for RuleSessionBuilder {
    fn merge(&mut self, unit_id: &str, script: &str) -> Result<CompiledUnit, CompileError> {
        let unit = parse_script(unit_id, script)?;
        let summary = unit.summary();
        self.units.push(unit);
        Ok(summary)
    }

    fn finish(self: Box<Self>) -> Arc<dyn DialogueSession> {
        // earlier units win when two define the same bot variable
        let mut bot_vars = HashMap::new();
        for unit in &self.units {
            for (k, v) in &unit.bot_vars {
                bot_vars.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        Arc::new(RuleSession {
            units: self.units,
            bot_vars,
            vars: DashMap::new(),
            written: DashMap::new(),
        })
    }
}

#[derive(Debug)]
pub struct RuleSession {
    units: Vec<Unit>,
    bot_vars: HashMap<String, String>,
    vars: DashMap<String, HashMap<String, String>>,
    /// Names the script set during the current reply, per session key.
    written: DashMap<String, BTreeSet<String>>,
}

impl RuleSession {
    fn write(&self, session_key: &str, name: &str, value: &str) {
        self.set_variable(session_key, name, value);
        self.written
            .entry(session_key.to_string())
            .or_default()
            .insert(name.to_string());
    }

    fn find(&self, topic: &str, padded_input: &str) -> Option<(&Unit, &Rule, Vec<String>)> {
        for unit in &self.units {
            for rule in unit.rules.iter().filter(|r| r.topic == topic) {
                if let Some(caps) = rule.pattern.captures(padded_input) {
                    let stars = caps
                        .iter()
                        .skip(1)
                        .map(|m| m.map(|m| m.as_str().trim().to_string()).unwrap_or_default())
                        .collect();
                    return Some((unit, rule, stars));
                }
            }
        }
        None
    }

    fn respond(&self, session_key: &str, input: &str, depth: usize) -> Reply {
        let padded = format!(" {}", normalize_input(input));
        let topic = self
            .get_variable(session_key, TOPIC_VAR)
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        let found = self.find(&topic, &padded).or_else(|| {
            if topic != DEFAULT_TOPIC {
                self.find(DEFAULT_TOPIC, &padded)
            } else {
                None
            }
        });
        let Some((unit, rule, stars)) = found else {
            trace!(input, topic, "no trigger matched");
            return Reply::no_match();
        };

        let info = MatchInfo {
            unit_id: unit.id.clone(),
            trigger: rule.trigger.clone(),
            wildcard: rule.wildcard,
            topic: rule.topic.clone(),
        };

        if let Some(target) = &rule.redirect {
            if depth >= MAX_REDIRECT_DEPTH {
                warn!(trigger = %rule.trigger, "redirect depth exceeded");
                return Reply::no_match();
            }
            let target = self.render(session_key, target, &stars);
            let mut redirected = self.respond(session_key, &target, depth + 1);
            if redirected.matched.is_some() {
                redirected.matched = Some(info);
            }
            return redirected;
        }

        let Some(template) = self.pick_template(session_key, rule, &stars) else {
            return Reply::no_match();
        };
        let text = self.render(session_key, &template, &stars);
        Reply {
            text,
            matched: Some(info),
        }
    }

    fn pick_template(&self, session_key: &str, rule: &Rule, stars: &[String]) -> Option<String> {
        for condition in &rule.conditions {
            let left = self.render(session_key, &condition.left, stars);
            let right = self.render(session_key, &condition.right, stars);
            if condition.op.holds(&left, &right) {
                return Some(condition.reply.clone());
            }
        }
        rule.replies.choose(&mut rand::rng()).cloned()
    }

    fn render(&self, session_key: &str, template: &str, stars: &[String]) -> String {
        let text = STAR_TAG.replace_all(template, |caps: &Captures| {
            let index = caps[1].parse::<usize>().unwrap_or(1).max(1);
            stars
                .get(index - 1)
                .cloned()
                .unwrap_or_else(|| UNDEFINED.to_string())
        });
        let text = BOT_TAG.replace_all(&text, |caps: &Captures| {
            self.bot_vars
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| UNDEFINED.to_string())
        });
        let text = VAR_TAG.replace_all(&text, |caps: &Captures| {
            if let Some(name) = caps.get(1) {
                return self
                    .get_variable(session_key, name.as_str())
                    .unwrap_or_else(|| UNDEFINED.to_string());
            }
            self.write(session_key, &caps[2], caps[3].trim());
            String::new()
        });
        let text = TOPIC_TAG.replace_all(&text, |caps: &Captures| {
            self.write(session_key, TOPIC_VAR, &caps[1]);
            String::new()
        });
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl DialogueSession for RuleSession {
    fn reply(&self, session_key: &str, input: &str) -> Reply {
        self.written.remove(session_key);
        self.respond(session_key, input, 0)
    }

    fn set_variable(&self, session_key: &str, name: &str, value: &str) {
        self.vars
            .entry(session_key.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    fn get_variable(&self, session_key: &str, name: &str) -> Option<String> {
        self.vars
            .get(session_key)
            .and_then(|vars| vars.get(name).cloned())
    }

    fn variables(&self, session_key: &str) -> BTreeMap<String, String> {
        self.vars
            .get(session_key)
            .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn written_keys(&self, session_key: &str) -> BTreeSet<String> {
        self.written
            .get(session_key)
            .map(|names| names.clone())
            .unwrap_or_default()
    }

    fn clear_session(&self, session_key: &str) {
        self.vars.remove(session_key);
        self.written.remove(session_key);
    }

    fn unit_ids(&self) -> Vec<String> {
        self.units.iter().map(|u| u.id.clone()).collect()
    }

    fn rule_count(&self) -> usize {
        self.units.iter().map(|u| u.rules.len()).sum()
    }
}
