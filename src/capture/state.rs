use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::triggers::{TriggerDefinition, TriggerTable};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CaptureStatus {
    Idle,
    Capturing,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        CaptureStatus::Idle
    }
}

/// One decoded key transition from the platform input layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    Character(char),
    Delete,
    Commit,
    /// A key with no printable output, e.g. a bare modifier.
    NoOp,
}

impl KeyInput {
    /// Maps a decoded key string to inputs. Composed keys can yield several characters.
    pub fn from_decoded(decoded: &str) -> Vec<KeyInput> {
        match decoded {
            "" => vec![KeyInput::NoOp],
            "\n" | "\r" | "\r\n" => vec![KeyInput::Commit],
            "\u{8}" | "\u{7f}" => vec![KeyInput::Delete],
            text => text.chars().map(KeyInput::Character).collect(),
        }
    }
}

/// A capture that ended with text worth keeping.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedCapture {
    /// Accumulated text, trimmed.
    pub text: String,
    pub trigger: TriggerDefinition,
    /// Characters still on screen from this session, trigger included.
    pub typed_chars: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Started(TriggerDefinition),
    Finished(FinishedCapture),
    /// The session ended with nothing but whitespace.
    Discarded,
}

/// The capture session: trigger detection while idle, text accumulation while capturing.
///
/// Pure state; the caller supplies the clock and performs every side effect.
#[derive(Debug)]
pub struct CaptureStateMachine {
    triggers: TriggerTable,
    idle_timeout: Duration,
    status: CaptureStatus,
    rolling: VecDeque<char>,
    accumulated: String,
    active: Option<TriggerDefinition>,
    last_event: Option<Instant>,
}

impl CaptureStateMachine {
    pub fn new(triggers: TriggerTable, idle_timeout: Duration) -> Self {
        Self {
            triggers,
            idle_timeout,
            status: CaptureStatus::Idle,
            rolling: VecDeque::new(),
            accumulated: String::new(),
            active: None,
            last_event: None,
        }
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated
    }

    pub fn active_trigger(&self) -> Option<&TriggerDefinition> {
        self.active.as_ref()
    }

    pub fn rolling_buffer(&self) -> String {
        self.rolling.iter().collect()
    }

    pub fn triggers(&self) -> &TriggerTable {
        &self.triggers
    }

    /// Swaps the trigger set. An in-flight capture keeps its trigger.
    pub fn set_triggers(&mut self, triggers: TriggerTable) {
        self.triggers = triggers;
        self.truncate_rolling();
    }

    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    pub fn handle(&mut self, input: KeyInput, now: Instant) -> Option<Transition> {
        match self.status {
            CaptureStatus::Idle => self.handle_idle(input, now),
            CaptureStatus::Capturing => self.handle_capturing(input, now),
        }
    }

    /// Ends the session if no input arrived within the idle timeout.
    pub fn check_idle(&mut self, now: Instant) -> Option<Transition> {
        if self.status != CaptureStatus::Capturing {
            return None;
        }
        let last_event = self.last_event.unwrap_or(now);
        if now.saturating_duration_since(last_event) >= self.idle_timeout {
            Some(self.finish())
        } else {
            None
        }
    }

    /// Closes the session and returns to idle.
    pub fn finish(&mut self) -> Transition {
        let typed_chars = self.accumulated.chars().count()
            + self.active.as_ref().map_or(0, TriggerDefinition::pattern_len);
        let text = self.accumulated.trim().to_string();
        let trigger = self.active.take();
        self.reset();

        match trigger {
            Some(trigger) if !text.is_empty() => Transition::Finished(FinishedCapture {
                text,
                trigger,
                typed_chars,
            }),
            _ => Transition::Discarded,
        }
    }

    pub fn reset(&mut self) {
        self.status = CaptureStatus::Idle;
        self.rolling.clear();
        self.accumulated.clear();
        self.active = None;
        self.last_event = None;
    }

    fn handle_idle(&mut self, input: KeyInput, now: Instant) -> Option<Transition> {
        let c = match input {
            KeyInput::Character(c) => c,
            KeyInput::Commit => {
                self.rolling.clear();
                return None;
            }
            KeyInput::Delete | KeyInput::NoOp => return None,
        };

        self.rolling.push_back(c);
        self.truncate_rolling();

        let buffer = self.rolling_buffer();
        let trigger = self.triggers.find_match(&buffer)?.clone();

        self.status = CaptureStatus::Capturing;
        self.rolling.clear();
        self.accumulated.clear();
        self.active = Some(trigger.clone());
        self.last_event = Some(now);
        Some(Transition::Started(trigger))
    }

    fn handle_capturing(&mut self, input: KeyInput, now: Instant) -> Option<Transition> {
        self.last_event = Some(now);
        match input {
            KeyInput::Character(c) => {
                self.accumulated.push(c);
                None
            }
            KeyInput::Delete => {
                self.accumulated.pop();
                None
            }
            KeyInput::Commit => Some(self.finish()),
            KeyInput::NoOp => None,
        }
    }

    fn truncate_rolling(&mut self) {
        let limit = self.triggers.longest_pattern_length();
        while self.rolling.len() > limit {
            self.rolling.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Category;

    fn machine() -> CaptureStateMachine {
        CaptureStateMachine::new(
            TriggerTable::new([
                TriggerDefinition::new("///", Category::Task),
                TriggerDefinition::new(",,,", Category::Note),
                TriggerDefinition::timer(";;;", Category::Task),
            ]),
            Duration::from_secs(3),
        )
    }

    fn type_text(m: &mut CaptureStateMachine, text: &str, now: Instant) -> Vec<Transition> {
        text.chars()
            .flat_map(|c| m.handle(KeyInput::Character(c), now))
            .collect()
    }

    #[test]
    fn text_without_a_trigger_stays_idle() {
        let mut m = machine();
        let now = Instant::now();
        assert!(type_text(&mut m, "hello // world,, ;; / , ;", now).is_empty());
        assert_eq!(m.status(), CaptureStatus::Idle);
        assert!(m.rolling_buffer().chars().count() <= 3);
    }

    #[test]
    fn typing_a_pattern_starts_capturing() {
        let mut m = machine();
        let transitions = type_text(&mut m, "abc///", Instant::now());

        assert_eq!(transitions.len(), 1);
        assert!(matches!(&transitions[0], Transition::Started(t) if t.pattern == "///"));
        assert_eq!(m.status(), CaptureStatus::Capturing);
        assert_eq!(m.accumulated_text(), "");
        assert!(m.rolling_buffer().chars().count() <= m.triggers().longest_pattern_length());
    }

    #[test]
    fn earlier_configured_pattern_wins() {
        let mut m = CaptureStateMachine::new(
            TriggerTable::new([
                TriggerDefinition::new(";;", Category::Note),
                TriggerDefinition::new("x;;", Category::Task),
            ]),
            Duration::from_secs(3),
        );
        let transitions = type_text(&mut m, "x;;", Instant::now());
        assert!(matches!(&transitions[0], Transition::Started(t) if t.pattern == ";;"));
    }

    #[test]
    fn deletes_never_go_below_empty() {
        let mut m = machine();
        let now = Instant::now();
        type_text(&mut m, "///ab", now);
        for _ in 0..10 {
            assert!(m.handle(KeyInput::Delete, now).is_none());
        }
        assert_eq!(m.accumulated_text(), "");
        assert_eq!(m.status(), CaptureStatus::Capturing);

        type_text(&mut m, "c", now);
        assert_eq!(m.accumulated_text(), "c");
    }

    #[test]
    fn idle_deletes_do_not_feed_matching() {
        let mut m = machine();
        let now = Instant::now();
        type_text(&mut m, "//", now);
        m.handle(KeyInput::Delete, now);
        let transitions = type_text(&mut m, "/", now);
        // Delete is ignored while idle, so the buffer still reads "///".
        assert_eq!(transitions.len(), 1);
    }

    #[test]
    fn commit_while_idle_breaks_a_partial_trigger() {
        let mut m = machine();
        let now = Instant::now();
        type_text(&mut m, "//", now);
        m.handle(KeyInput::Commit, now);
        assert!(type_text(&mut m, "/", now).is_empty());
        assert_eq!(m.status(), CaptureStatus::Idle);
    }

    #[test]
    fn commit_finishes_with_trimmed_text() {
        let mut m = machine();
        let now = Instant::now();
        type_text(&mut m, "///  buy milk ", now);
        let transition = m.handle(KeyInput::Commit, now).unwrap();

        match transition {
            Transition::Finished(finished) => {
                assert_eq!(finished.text, "buy milk");
                assert_eq!(finished.trigger.pattern, "///");
                assert_eq!(finished.typed_chars, "  buy milk ".len() + 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.status(), CaptureStatus::Idle);
        assert!(m.active_trigger().is_none());
        assert_eq!(m.accumulated_text(), "");
    }

    #[test]
    fn whitespace_only_capture_is_discarded() {
        let mut m = machine();
        let now = Instant::now();
        type_text(&mut m, ",,,   ", now);
        assert_eq!(m.handle(KeyInput::Commit, now), Some(Transition::Discarded));
        assert_eq!(m.status(), CaptureStatus::Idle);
    }

    #[test]
    fn idle_timeout_is_measured_from_the_last_event() {
        let mut m = machine();
        let start = Instant::now();
        type_text(&mut m, "///note", start);

        let later = start + Duration::from_secs(2);
        m.handle(KeyInput::Delete, later);
        assert!(m.check_idle(start + Duration::from_secs(4)).is_none());

        let expired = m.check_idle(later + Duration::from_secs(3)).unwrap();
        assert!(matches!(expired, Transition::Finished(f) if f.text == "not"));
        assert!(m.check_idle(later + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn empty_session_times_out_to_discard() {
        let mut m = machine();
        let start = Instant::now();
        type_text(&mut m, "///", start);
        assert_eq!(
            m.check_idle(start + Duration::from_secs(5)),
            Some(Transition::Discarded)
        );
        assert_eq!(m.status(), CaptureStatus::Idle);
    }

    #[test]
    fn decoded_keys_map_to_inputs() {
        assert_eq!(KeyInput::from_decoded(""), vec![KeyInput::NoOp]);
        assert_eq!(KeyInput::from_decoded("\r"), vec![KeyInput::Commit]);
        assert_eq!(KeyInput::from_decoded("\u{7f}"), vec![KeyInput::Delete]);
        assert_eq!(
            KeyInput::from_decoded("é!"),
            vec![KeyInput::Character('é'), KeyInput::Character('!')]
        );
    }

    #[test]
    fn shrinking_the_trigger_set_truncates_the_buffer() {
        let mut m = machine();
        type_text(&mut m, "ab/", Instant::now());
        m.set_triggers(TriggerTable::new([TriggerDefinition::new("#", Category::Note)]));
        assert_eq!(m.rolling_buffer(), "/");
    }
}
