//! Clarifying-question payloads and the fallback answer message.

use std::collections::HashMap;

use corral_core::session::PendingQuestion;
use serde_json::Value;

/// Build a pending question from a `question-pending` payload. The tool
/// input may be nested under `input` or be the payload itself.
pub fn from_payload(payload: &Value) -> Option<PendingQuestion> {
    let tool_use_id = ["toolUseId", "tool_use_id"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .unwrap_or_default();
    let input = payload.get("input").unwrap_or(payload);
    PendingQuestion::from_tool_input(tool_use_id, input)
}

/// Format answers as a user message, in the order the questions were asked.
/// Answers keyed by text that matches no asked question follow at the end.
pub fn format_answers(question: Option<&PendingQuestion>, answers: &HashMap<String, String>) -> String {
    let mut out = String::from("Here are my answers to your questions:\n");
    let asked: Vec<&str> = question
        .map(|q| q.questions.iter().map(|q| q.question.as_str()).collect())
        .unwrap_or_default();

    for text in &asked {
        if let Some(answer) = answers.get(*text) {
            out.push_str(&format!("\nQ: {text}\nA: {answer}\n"));
        }
    }
    let mut extra: Vec<(&String, &String)> = answers.iter().filter(|(k, _)| !asked.contains(&k.as_str())).collect();
    extra.sort();
    for (text, answer) in extra {
        out.push_str(&format!("\nQ: {text}\nA: {answer}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn asked() -> PendingQuestion {
        PendingQuestion::from_tool_input(
            "toolu_q",
            &json!({"questions": [
                {"header": "DB", "question": "Which database?", "options": [{"label": "Postgres"}]},
                {"header": "Auth", "question": "Which auth provider?"}
            ]}),
        )
        .unwrap()
    }

    #[test]
    fn payload_nested_or_flat() {
        let nested = from_payload(&json!({"toolUseId": "t9", "input": {"questions": [{"question": "A?"}]}})).unwrap();
        assert_eq!(nested.tool_use_id, "t9");
        assert_eq!(nested.questions.len(), 1);
        let flat = from_payload(&json!({"questions": [{"question": "A?"}, {"question": "B?"}]})).unwrap();
        assert_eq!(flat.questions.len(), 2);
        assert!(from_payload(&json!({"questions": []})).is_none());
    }

    #[test]
    fn answers_follow_question_order() {
        let answers = HashMap::from([
            ("Which auth provider?".to_string(), "OIDC".to_string()),
            ("Which database?".to_string(), "Postgres".to_string()),
            ("Anything else?".to_string(), "No".to_string()),
        ]);
        let text = format_answers(Some(&asked()), &answers);
        let db = text.find("Which database?").unwrap();
        let auth = text.find("Which auth provider?").unwrap();
        let extra = text.find("Anything else?").unwrap();
        assert!(db < auth && auth < extra);
        assert!(text.contains("A: Postgres"));
    }
}
