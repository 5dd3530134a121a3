use panebus_core::command::WebCommand;
use panebus_core::event::WebEvent;
use panebus_core::types::{PaneKind, PaneMetadata, ResourceId};
use panebus_core::{PaneCommand, PaneEvent, PaneId};

use super::{BackendError, PaneBackend, wrong_domain};

/// In-memory web view: a linear history with a cursor.
#[derive(Debug)]
pub struct WebBackend {
    pane_id: PaneId,
    history: Vec<String>,
    cursor: usize,
    open: bool,
}

impl WebBackend {
    pub fn new(pane_id: PaneId) -> Self {
        Self {
            pane_id,
            history: Vec::new(),
            cursor: 0,
            open: false,
        }
    }

    fn current(&self) -> Option<&str> {
        self.history.get(self.cursor).map(String::as_str)
    }

    fn can_go_back(&self) -> bool {
        !self.history.is_empty() && self.cursor > 0
    }

    fn can_go_forward(&self) -> bool {
        self.cursor + 1 < self.history.len()
    }

    fn load(&self, url: &str, history_changed: bool) -> Vec<PaneEvent> {
        let mut events = vec![
            WebEvent::NavigationStarted {
                url: url.to_string(),
            },
            WebEvent::LoadProgress { percent: 100 },
            WebEvent::NavigationCompleted {
                url: url.to_string(),
            },
            WebEvent::TitleChanged {
                title: title_for(url),
            },
        ];
        if history_changed {
            events.push(WebEvent::HistoryChanged {
                can_go_back: self.can_go_back(),
                can_go_forward: self.can_go_forward(),
            });
        }
        events.into_iter().map(PaneEvent::Web).collect()
    }
}

fn validate_url(url: &str) -> Result<(), BackendError> {
    let has_scheme = url
        .split_once("://")
        .is_some_and(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty());
    if has_scheme || url.starts_with("about:") {
        Ok(())
    } else {
        Err(BackendError::Invalid(format!("not an absolute url: {url:?}")))
    }
}

/// Host part of the url, or the url itself.
fn title_for(url: &str) -> String {
    url.split_once("://")
        .map(|(_, rest)| rest.split('/').next().unwrap_or(rest))
        .unwrap_or(url)
        .to_string()
}

impl PaneBackend for WebBackend {
    fn kind(&self) -> PaneKind {
        PaneKind::WebView
    }

    fn start(&mut self, _metadata: &PaneMetadata) -> Result<Vec<PaneEvent>, BackendError> {
        self.open = true;
        Ok(Vec::new())
    }

    fn apply(&mut self, command: &PaneCommand) -> Result<Vec<PaneEvent>, BackendError> {
        let PaneCommand::Web(command) = command else {
            return Err(wrong_domain(self.kind(), command));
        };
        match command {
            WebCommand::Navigate { url } => {
                validate_url(url)?;
                if !self.history.is_empty() {
                    self.history.truncate(self.cursor + 1);
                }
                self.history.push(url.clone());
                self.cursor = self.history.len() - 1;
                Ok(self.load(url, true))
            }
            WebCommand::Reload => {
                let url = self
                    .current()
                    .ok_or_else(|| BackendError::Invalid("nothing to reload".to_string()))?;
                Ok(self.load(url, false))
            }
            WebCommand::GoBack => {
                if !self.can_go_back() {
                    return Err(BackendError::Invalid("no back history".to_string()));
                }
                self.cursor -= 1;
                let url = self.history[self.cursor].clone();
                Ok(self.load(&url, true))
            }
            WebCommand::GoForward => {
                if !self.can_go_forward() {
                    return Err(BackendError::Invalid("no forward history".to_string()));
                }
                self.cursor += 1;
                let url = self.history[self.cursor].clone();
                Ok(self.load(&url, true))
            }
        }
    }

    fn shutdown(&mut self) -> Vec<ResourceId> {
        if !std::mem::take(&mut self.open) {
            return Vec::new();
        }
        vec![ResourceId::new(format!("webview:{}", self.pane_id))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nav(url: &str) -> PaneCommand {
        PaneCommand::Web(WebCommand::Navigate {
            url: url.to_string(),
        })
    }

    fn history_event(events: &[PaneEvent]) -> Option<(bool, bool)> {
        events.iter().find_map(|e| match e {
            PaneEvent::Web(WebEvent::HistoryChanged {
                can_go_back,
                can_go_forward,
            }) => Some((*can_go_back, *can_go_forward)),
            _ => None,
        })
    }

    #[test]
    fn navigate_back_forward() {
        let mut web = WebBackend::new(PaneId::new("w1"));
        web.start(&PaneMetadata::default()).expect("start");
        web.apply(&nav("https://a.test/x")).expect("a");
        let events = web.apply(&nav("https://b.test/")).expect("b");
        assert_eq!(history_event(&events), Some((true, false)));
        assert!(events.contains(&PaneEvent::Web(WebEvent::TitleChanged {
            title: "b.test".to_string()
        })));

        let events = web
            .apply(&PaneCommand::Web(WebCommand::GoBack))
            .expect("back");
        assert_eq!(history_event(&events), Some((false, true)));
        let err = web
            .apply(&PaneCommand::Web(WebCommand::GoBack))
            .expect_err("at start");
        assert!(matches!(err, BackendError::Invalid(_)));
        web.apply(&PaneCommand::Web(WebCommand::GoForward))
            .expect("forward");
    }

    #[test]
    fn navigating_from_middle_drops_forward_history() {
        let mut web = WebBackend::new(PaneId::new("w1"));
        web.start(&PaneMetadata::default()).expect("start");
        web.apply(&nav("https://a.test")).expect("a");
        web.apply(&nav("https://b.test")).expect("b");
        web.apply(&PaneCommand::Web(WebCommand::GoBack)).expect("back");
        let events = web.apply(&nav("https://c.test")).expect("c");
        assert_eq!(history_event(&events), Some((true, false)));
    }

    #[test]
    fn relative_url_rejected() {
        let mut web = WebBackend::new(PaneId::new("w1"));
        web.start(&PaneMetadata::default()).expect("start");
        assert!(matches!(
            web.apply(&nav("index.html")),
            Err(BackendError::Invalid(_))
        ));
        assert!(matches!(
            web.apply(&PaneCommand::Web(WebCommand::Reload)),
            Err(BackendError::Invalid(_))
        ));
    }
}
