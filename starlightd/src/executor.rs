//! Tiered, verified execution of a single page action.
//!
//! Candidates are tried in tier order, each under its own timeout. A
//! candidate wins only if it locates and the action's effect is verified.
//! Clicks on submission-like goals that change nothing are escalated
//! through a re-click, keyboard activation and a dispatched event before
//! the candidate is given up.

use std::sync::Arc;
use std::time::Duration;

use starlight_driver::{DriverAction, DriverError, ElementHandle, PageDriver, PageState};
use starlight_protocol::{ActionKind, RpcCode};
use thiserror::Error;
use tracing::{debug, info, warn};

const SUBMISSION_WORDS: &[&str] = &[
    "login", "submit", "checkout", "continue", "sign in", "register", "next", "pay", "confirm",
];

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("no selector could be resolved for '{goal}'")]
    ResolutionMiss { goal: String },

    #[error("every candidate for '{goal}' failed (tried: {})", tried.join(", "))]
    Exhausted { goal: String, tried: Vec<String> },

    #[error("'{0}' needs a value")]
    MissingInput(String),

    #[error("unsupported command '{0}'")]
    UnsupportedCommand(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl ExecutionError {
    pub fn code(&self) -> i32 {
        match self {
            ExecutionError::ResolutionMiss { .. } => RpcCode::RESOLUTION_MISS,
            ExecutionError::MissingInput(_) | ExecutionError::UnsupportedCommand(_) => {
                RpcCode::INVALID_PARAMS
            }
            ExecutionError::Exhausted { .. } | ExecutionError::Driver(_) => RpcCode::EXECUTION_FAILED,
        }
    }
}

/// One action as the executor sees it, independent of who asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub kind: ActionKind,
    /// Goal text (or the literal selector) used in errors and for the
    /// submission check.
    pub goal: String,
    pub input: Option<String>,
    pub key: Option<String>,
    pub files: Vec<String>,
}

impl Step {
    pub fn new(kind: ActionKind, goal: impl Into<String>) -> Self {
        Self {
            kind,
            goal: goal.into(),
            input: None,
            key: None,
            files: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: Option<String>) -> Self {
        self.input = input;
        self
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// Reject steps that cannot possibly run before touching the page.
    pub fn check(&self) -> Result<(), ExecutionError> {
        match &self.kind {
            ActionKind::Generic(name) => Err(ExecutionError::UnsupportedCommand(name.clone())),
            ActionKind::Fill | ActionKind::Type | ActionKind::Select if self.input.is_none() => {
                Err(ExecutionError::MissingInput(self.kind.to_string()))
            }
            ActionKind::Press if self.key.is_none() => {
                Err(ExecutionError::MissingInput(self.kind.to_string()))
            }
            ActionKind::Upload if self.files.is_empty() => {
                Err(ExecutionError::MissingInput(self.kind.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    /// Winning selector; `None` for page-level actions.
    pub selector: Option<String>,
    pub attempts: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub attempt_timeout: Duration,
    pub stabilization_pause: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(2_500),
            stabilization_pause: Duration::from_millis(500),
        }
    }
}

pub struct Executor {
    page: Arc<dyn PageDriver>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(page: Arc<dyn PageDriver>, settings: ExecutorSettings) -> Self {
        Self { page, settings }
    }

    pub async fn navigate(&self, url: &str) -> Result<(), ExecutionError> {
        self.page.navigate(url).await?;
        info!(url, "navigated");
        Ok(())
    }

    /// Run `step` against the first candidate in `tiers` that verifies.
    /// Key presses, typing and scrolling may run page-wide when no
    /// candidates are given.
    pub async fn execute(&self, step: &Step, tiers: &[Vec<String>]) -> Result<Executed, ExecutionError> {
        step.check()?;
        let candidates: Vec<&String> = tiers.iter().flatten().collect();

        if candidates.is_empty() {
            return self.execute_page_level(step).await;
        }

        let mut tried = Vec::new();
        for (attempt, selector) in candidates.into_iter().enumerate() {
            tried.push(selector.clone());
            match tokio::time::timeout(self.settings.attempt_timeout, self.attempt(step, selector)).await {
                Ok(Ok(true)) => {
                    info!(goal = %step.goal, selector = %selector, attempt = attempt + 1, "action verified");
                    return Ok(Executed {
                        selector: Some(selector.clone()),
                        attempts: attempt + 1,
                    });
                }
                Ok(Ok(false)) => debug!(selector = %selector, "candidate did not verify"),
                Ok(Err(err)) => debug!(selector = %selector, error = %err, "candidate failed"),
                Err(_) => warn!(
                    selector = %selector,
                    timeout_ms = self.settings.attempt_timeout.as_millis() as u64,
                    "candidate timed out"
                ),
            }
        }

        Err(ExecutionError::Exhausted {
            goal: step.goal.clone(),
            tried,
        })
    }

    async fn execute_page_level(&self, step: &Step) -> Result<Executed, ExecutionError> {
        let verified = match &step.kind {
            ActionKind::Press => {
                let key = step.key.clone().unwrap_or_default();
                self.page.act(None, &DriverAction::Press(key)).await?;
                true
            }
            ActionKind::Type => {
                let text = step.input.clone().unwrap_or_default();
                self.page.act(None, &DriverAction::Type(text)).await?;
                true
            }
            ActionKind::Scroll => {
                let before = self.page.page_state().await?;
                self.page.act(None, &DriverAction::ScrollToBottom).await?;
                let after = self.page.page_state().await?;
                scrolled(&before, &after)
            }
            _ => {
                return Err(ExecutionError::ResolutionMiss {
                    goal: step.goal.clone(),
                })
            }
        };
        if verified {
            Ok(Executed {
                selector: None,
                attempts: 1,
            })
        } else {
            Err(ExecutionError::Exhausted {
                goal: step.goal.clone(),
                tried: vec!["window".to_string()],
            })
        }
    }

    async fn attempt(&self, step: &Step, selector: &str) -> Result<bool, DriverError> {
        let Some(element) = self.page.locate(selector).await? else {
            return Ok(false);
        };
        let input = step.input.clone().unwrap_or_default();

        match &step.kind {
            ActionKind::Click => self.click_verified(&element, is_submission_like(&step.goal)).await,
            ActionKind::Fill => {
                self.page.act(Some(&element), &DriverAction::Fill(input.clone())).await?;
                Ok(self.page.read_value(&element).await? == input)
            }
            ActionKind::Type => {
                self.page.act(Some(&element), &DriverAction::Type(input.clone())).await?;
                Ok(self.page.read_value(&element).await?.ends_with(&input))
            }
            ActionKind::Select => {
                let before = self.page.read_value(&element).await?;
                self.page.act(Some(&element), &DriverAction::Select(input.clone())).await?;
                let after = self.page.read_value(&element).await?;
                // Options may be chosen by label, in which case the value
                // differs from the input but still changed.
                Ok(after == input || (!after.is_empty() && after != before))
            }
            ActionKind::Scroll => {
                let before = self.page.page_state().await?;
                self.page.act(Some(&element), &DriverAction::ScrollIntoView).await?;
                let after = self.page.page_state().await?;
                Ok(scrolled(&before, &after))
            }
            ActionKind::Hover => self.act_plain(&element, DriverAction::Hover).await,
            ActionKind::Check => self.act_plain(&element, DriverAction::Check).await,
            ActionKind::Uncheck => self.act_plain(&element, DriverAction::Uncheck).await,
            ActionKind::Upload => {
                self.act_plain(&element, DriverAction::Upload(step.files.clone()))
                    .await
            }
            ActionKind::Press => {
                let key = step.key.clone().unwrap_or_default();
                self.act_plain(&element, DriverAction::Press(key)).await
            }
            ActionKind::Navigate | ActionKind::Checkpoint | ActionKind::Generic(_) => Ok(false),
        }
    }

    async fn act_plain(&self, element: &ElementHandle, action: DriverAction) -> Result<bool, DriverError> {
        self.page.act(Some(element), &action).await?;
        Ok(true)
    }

    async fn click_verified(&self, element: &ElementHandle, escalate: bool) -> Result<bool, DriverError> {
        let before = self.page.page_state().await?;
        self.page.act(Some(element), &DriverAction::Click).await?;
        if self.changed_since(&before).await {
            return Ok(true);
        }
        if !escalate {
            // Plenty of clicks legitimately leave URL and text untouched.
            return Ok(true);
        }

        tokio::time::sleep(self.settings.stabilization_pause).await;
        for action in [
            DriverAction::Click,
            DriverAction::KeyboardActivate,
            DriverAction::DispatchClick,
        ] {
            debug!(selector = %element.selector, action = action.name(), "escalating click");
            if let Err(err) = self.page.act(Some(element), &action).await {
                debug!(selector = %element.selector, error = %err, "escalation step failed");
                continue;
            }
            if self.changed_since(&before).await {
                info!(selector = %element.selector, via = action.name(), "click took effect after escalation");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn changed_since(&self, before: &PageState) -> bool {
        match self.page.page_state().await {
            Ok(after) => after.url != before.url || after.text_length != before.text_length,
            Err(err) => {
                debug!(error = %err, "page state unavailable after click");
                false
            }
        }
    }
}

fn scrolled(before: &PageState, after: &PageState) -> bool {
    (after.scroll_y - before.scroll_y).abs() > f64::EPSILON || before.at_scroll_limit()
}

/// Whether `goal` names a form submission or step advance.
pub fn is_submission_like(goal: &str) -> bool {
    let words: Vec<String> = goal
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let padded = format!(" {} ", words.join(" "));
    SUBMISSION_WORDS
        .iter()
        .any(|word| padded.contains(&format!(" {word} ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use starlight_driver::scripted::{Activation, ScriptedElement, ScriptedPage};

    fn executor(page: &ScriptedPage) -> Executor {
        Executor::new(
            Arc::new(page.clone()),
            ExecutorSettings {
                attempt_timeout: Duration::from_millis(200),
                stabilization_pause: Duration::from_millis(5),
            },
        )
    }

    fn tiers(selectors: &[&[&str]]) -> Vec<Vec<String>> {
        selectors
            .iter()
            .map(|tier| tier.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn submission_words_match_whole_words() {
        assert!(is_submission_like("Login"));
        assert!(is_submission_like("Sign In now"));
        assert!(is_submission_like("#submit-order"));
        assert!(!is_submission_like("display settings"));
        assert!(!is_submission_like("Open menu"));
    }

    #[test]
    fn step_check_rejects_generic_and_missing_input() {
        let generic = Step::new(ActionKind::Generic("teleport".into()), "x");
        assert!(matches!(generic.check(), Err(ExecutionError::UnsupportedCommand(_))));
        let fill = Step::new(ActionKind::Fill, "Email");
        assert_eq!(fill.check().unwrap_err().code(), RpcCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn first_verified_candidate_wins() {
        let page = ScriptedPage::new("http://app.test/")
            .with_element(ScriptedElement::button("#login", "Login"));
        let outcome = executor(&page)
            .execute(&Step::new(ActionKind::Click, "Login"), &tiers(&[&["#missing"], &["#login"]]))
            .await
            .unwrap();
        assert_eq!(outcome.selector.as_deref(), Some("#login"));
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn stubborn_submit_escalates_to_keyboard() {
        let page = ScriptedPage::new("http://app.test/").with_element(
            ScriptedElement::button("#submit", "Submit").only_on(&[Activation::Keyboard]),
        );
        let outcome = executor(&page)
            .execute(&Step::new(ActionKind::Click, "Submit"), &tiers(&[&["#submit"]]))
            .await
            .unwrap();
        assert_eq!(outcome.selector.as_deref(), Some("#submit"));
        assert_eq!(
            page.actions(),
            vec!["click #submit", "click #submit", "keyboard_activate #submit"]
        );
    }

    #[tokio::test]
    async fn inert_submit_exhausts_with_tried_candidates() {
        let page = ScriptedPage::new("http://app.test/")
            .with_element(ScriptedElement::button("#pay", "Pay").inert())
            .with_element(ScriptedElement::button(".pay", "Pay").inert());
        let err = executor(&page)
            .execute(&Step::new(ActionKind::Click, "Pay"), &tiers(&[&["#pay", ".pay"]]))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Exhausted { goal, tried } => {
                assert_eq!(goal, "Pay");
                assert_eq!(tried, vec!["#pay".to_string(), ".pay".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn inert_ordinary_click_is_accepted() {
        let page = ScriptedPage::new("http://app.test/")
            .with_element(ScriptedElement::button("#menu", "Menu").inert());
        executor(&page)
            .execute(&Step::new(ActionKind::Click, "Menu"), &tiers(&[&["#menu"]]))
            .await
            .unwrap();
        assert_eq!(page.actions(), vec!["click #menu"]);
    }

    #[tokio::test]
    async fn fill_requires_readback() {
        let page = ScriptedPage::new("http://app.test/")
            .with_element(ScriptedElement::input("#locked").rejects_input())
            .with_element(ScriptedElement::input("#email"));
        let step = Step::new(ActionKind::Fill, "Email").with_input(Some("a@b.c".into()));
        let outcome = executor(&page)
            .execute(&step, &tiers(&[&["#locked", "#email"]]))
            .await
            .unwrap();
        assert_eq!(outcome.selector.as_deref(), Some("#email"));
        assert_eq!(page.value_of("#email").as_deref(), Some("a@b.c"));
    }

    #[tokio::test]
    async fn hanging_candidate_times_out() {
        let page = ScriptedPage::new("http://app.test/")
            .with_element(ScriptedElement::button("#slow", "Go").hangs())
            .with_element(ScriptedElement::button("#fast", "Go"));
        let outcome = executor(&page)
            .execute(&Step::new(ActionKind::Click, "Go"), &tiers(&[&["#slow"], &["#fast"]]))
            .await
            .unwrap();
        assert_eq!(outcome.selector.as_deref(), Some("#fast"));
    }

    #[tokio::test]
    async fn page_scroll_verifies_offset() {
        let page = ScriptedPage::new("http://app.test/").with_scroll_height(1200.0);
        let outcome = executor(&page)
            .execute(&Step::new(ActionKind::Scroll, "bottom"), &[])
            .await
            .unwrap();
        assert_eq!(outcome.selector, None);
        assert_eq!(page.page_state().await.unwrap().scroll_y, 1200.0);

        let err = executor(&page)
            .execute(&Step::new(ActionKind::Hover, "menu"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ResolutionMiss { .. }));
    }
}
