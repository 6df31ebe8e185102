use crate::config::TargetConfig;
use crate::domain::types::Tool;

struct PromptTemplate {
    intro: &'static str,
    tools: &'static str,
    closing: &'static str,
}

const EN: PromptTemplate = PromptTemplate {
    intro: "You are a natural-language interface to a set of external services. You can interact with the following systems through tools:\n\n",
    tools: "Available tools:\n",
    closing: "\nUse the appropriate tools to help users accomplish their tasks. If unsure about the user's intent, ask for clarification before acting.",
};

const ZH: PromptTemplate = PromptTemplate {
    intro: "你是一个自然语言接口，可以通过工具与以下系统交互：\n\n",
    tools: "可用工具：\n",
    closing: "\n请根据用户需求使用合适的工具完成任务。如果不确定用户意图，先询问用户。",
};

const JA: PromptTemplate = PromptTemplate {
    intro: "あなたは外部サービスへの自然言語インターフェースです。以下のシステムとツールを通じてやり取りできます：\n\n",
    tools: "利用可能なツール：\n",
    closing: "\nユーザーの要求に応じて適切なツールを使用してタスクを完了してください。意図が不明な場合は先に確認してください。",
};

fn template(language: &str) -> &'static PromptTemplate {
    match language {
        "zh" => &ZH,
        "ja" => &JA,
        _ => &EN,
    }
}

/// Builds the system prompt from the configured language, target summaries
/// and the discovered tool catalog.
pub fn build_system_prompt(language: &str, targets: &[TargetConfig], tools: &[Tool]) -> String {
    let t = template(language);

    let mut prompt = String::from(t.intro);
    for target in targets {
        let desc = if target.description.is_empty() {
            target.name.as_str()
        } else {
            target.description.as_str()
        };
        prompt.push_str(&format!("## {}\n{}\n\n", target.name, desc));
    }

    if !tools.is_empty() {
        prompt.push_str(t.tools);
        for tool in tools {
            prompt.push_str(&format!(
                "- {}: {}\n",
                tool.function.name, tool.function.description
            ));
        }
    }

    prompt.push_str(t.closing);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_language_falls_back_to_english() {
        let prompt = build_system_prompt("fr", &[], &[]);
        assert!(prompt.starts_with("You are a natural-language interface"));
    }

    #[test]
    fn lists_targets_and_tools() {
        let targets = vec![TargetConfig {
            name: "petstore".into(),
            description: "A pet shop API".into(),
            ..Default::default()
        }];
        let tools = vec![Tool::function(
            "petstore__listPets",
            "List all pets",
            json!({"type": "object", "properties": {}}),
        )];
        let prompt = build_system_prompt("en", &targets, &tools);
        assert!(prompt.contains("## petstore"));
        assert!(prompt.contains("A pet shop API"));
        assert!(prompt.contains("- petstore__listPets: List all pets"));
    }

    #[test]
    fn chinese_template_is_used_for_zh() {
        let prompt = build_system_prompt("zh", &[], &[]);
        assert!(prompt.contains("自然语言接口"));
    }
}
