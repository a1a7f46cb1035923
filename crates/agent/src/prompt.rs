use std::fmt::Write as _;

use chrono::NaiveDate;

use pulse_core::domain::access::{AccessGrant, Persona, RowScope};
use pulse_core::domain::conversation::MemoryItem;
use pulse_core::domain::employee::Employee;

use crate::llm::EngineId;
use crate::tool_loop::EvidenceEntry;

/// Everything the system instructions depend on.
#[derive(Clone, Debug)]
pub struct InstructionConfig<'a> {
    pub caller: &'a Employee,
    pub grant: &'a AccessGrant,
    /// `None` when the caller sees the whole company.
    pub visible_count: Option<usize>,
    pub persona: Option<&'a Persona>,
    pub memories: &'a [MemoryItem],
    pub today: NaiveDate,
    pub is_proactive: bool,
    pub tool_names: Vec<&'static str>,
}

fn scope_sentence(scope: RowScope, visible_count: Option<usize>) -> String {
    match (scope, visible_count) {
        (RowScope::OwnOnly, _) => "You may only discuss the caller's own sales.".to_string(),
        (RowScope::All, _) | (_, None) => {
            "You may discuss sales across the whole company.".to_string()
        }
        (RowScope::OwnAndSubtree, Some(count)) => format!(
            "You may discuss the caller and their reporting line: {count} people in total."
        ),
        (RowScope::DivisionOnly, Some(count)) => format!(
            "You may discuss the caller's reporting line within their division: \
             {count} people in total."
        ),
    }
}

/// Assembles the system instructions for one primary request.
pub fn build_instructions(config: &InstructionConfig<'_>) -> String {
    let caller = config.caller;
    let grant = config.grant;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "You are Pulse, a sales performance assistant. Today is {}.",
        config.today.format("%Y-%m-%d")
    );
    let _ = writeln!(
        out,
        "You are talking to {} (employee {}), {} in the {} division, with the `{}` role.",
        caller.name, caller.id, caller.title, caller.division, grant.role_name
    );
    let _ = writeln!(out, "{}", scope_sentence(grant.row_scope, config.visible_count));

    out.push_str("\nRules:\n");
    out.push_str("- Answer only from tool results. Never invent figures.\n");
    out.push_str(
        "- If a tool reports `out_of_scope` or `not permitted`, \
         say the data is outside the caller's access.\n",
    );
    out.push_str("- Quote amounts with two decimals and name the period they cover.\n");
    if grant.capabilities.recommendations {
        out.push_str("- You may close with one concrete, data-backed recommendation.\n");
    } else {
        out.push_str("- Do not give coaching or recommendations.\n");
    }
    if grant.capabilities.forecasting {
        out.push_str("- Label projections as estimates and state the history they are based on.\n");
    }

    if !config.tool_names.is_empty() {
        let _ = writeln!(out, "\nTools available: {}.", config.tool_names.join(", "));
    }

    if let Some(persona) = config.persona {
        let _ = writeln!(out, "\nPersona: {}. Tone: {}.", persona.name, persona.tone);
        if !persona.format_guidance.trim().is_empty() {
            let _ = writeln!(out, "{}", persona.format_guidance.trim());
        }
    }

    if !config.memories.is_empty() {
        out.push_str("\nWhat you know about this caller:\n");
        for memory in config.memories {
            let _ = writeln!(out, "- {}: {}", memory.key, memory.value);
        }
    }

    if config.is_proactive {
        out.push_str(
            "\nThis is a proactive check-in the caller did not ask for. Lead with the single most \
             notable change in their numbers and keep it under five sentences.\n",
        );
    }

    out.trim_end().to_string()
}

/// Instructions appended for a secondary engine.
pub fn engine_overlay(engine: EngineId) -> &'static str {
    match engine {
        EngineId::Primary => "",
        EngineId::Analyst => {
            "You are a second analyst reviewing the same question. \
             Produce an independent analysis. You may call tools to check figures. \
             Do not reveal which backend or model you are."
        }
        EngineId::Critic => {
            "You are an independent reviewer. Produce an independent analysis of the \
             evidence below and point out anything the first answer may have missed. \
             You cannot call tools. Do not reveal which backend or model you are."
        }
    }
}

/// The primary's tool evidence, embedded verbatim.
pub fn evidence_context(evidence: &[EvidenceEntry]) -> String {
    if evidence.is_empty() {
        return "No tool data was gathered for this question.".to_string();
    }
    let mut out = String::from("Tool results gathered for this question, verbatim:\n");
    for entry in evidence {
        let _ = writeln!(out, "- {} {} -> {}", entry.tool, entry.arguments, entry.result);
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use pulse_core::domain::access::{Capabilities, Persona};
    use pulse_core::domain::conversation::MemoryItem;

    use super::{build_instructions, engine_overlay, evidence_context, InstructionConfig};
    use crate::llm::EngineId;
    use crate::test_support::{ic_context, manager_context, today};
    use crate::tool_loop::EvidenceEntry;

    #[test]
    fn own_only_instructions_name_the_caller_and_scope() {
        let ctx = ic_context();
        let text = build_instructions(&InstructionConfig {
            caller: &ctx.caller,
            grant: &ctx.grant,
            visible_count: Some(1),
            persona: None,
            memories: &[],
            today: today(),
            is_proactive: false,
            tool_names: vec!["get_sales_summary"],
        });

        assert!(text.contains("Today is 2026-05-14"));
        assert!(text.contains("Aisha (employee 5)"));
        assert!(text.contains("only discuss the caller's own sales"));
        assert!(text.contains("Tools available: get_sales_summary."));
        assert!(text.contains("Do not give coaching"));
        assert!(!text.contains("proactive"));
    }

    #[test]
    fn persona_memories_and_proactive_flag_are_included() {
        let mut ctx = manager_context();
        ctx.grant.capabilities = Capabilities { recommendations: true, ..Capabilities::default() };
        let persona = Persona {
            id: "coach".to_string(),
            name: "Coach".to_string(),
            tone: "encouraging".to_string(),
            format_guidance: "Use bullet points.".to_string(),
        };
        let memories = vec![MemoryItem {
            key: "focus".to_string(),
            value: "renewals".to_string(),
            expires_at: Some(Utc::now() + Duration::days(1)),
        }];

        let text = build_instructions(&InstructionConfig {
            caller: &ctx.caller,
            grant: &ctx.grant,
            visible_count: Some(3),
            persona: Some(&persona),
            memories: &memories,
            today: today(),
            is_proactive: true,
            tool_names: Vec::new(),
        });

        assert!(text.contains("3 people in total"));
        assert!(text.contains("Persona: Coach. Tone: encouraging."));
        assert!(text.contains("Use bullet points."));
        assert!(text.contains("- focus: renewals"));
        assert!(text.contains("proactive check-in"));
        assert!(text.contains("one concrete, data-backed recommendation"));
        assert!(!text.contains("Tools available"));
    }

    #[test]
    fn overlays_never_name_a_vendor() {
        for engine in [EngineId::Analyst, EngineId::Critic] {
            let overlay = engine_overlay(engine).to_lowercase();
            assert!(overlay.contains("independent analysis"));
            for vendor in ["openai", "deepseek", "xai", "grok", "gpt"] {
                assert!(!overlay.contains(vendor), "{engine} overlay names {vendor}");
            }
        }
    }

    #[test]
    fn evidence_is_embedded_verbatim() {
        let evidence = vec![EvidenceEntry {
            round: 1,
            call_id: "call_1".to_string(),
            tool: "get_sales_summary".to_string(),
            arguments: json!({ "employee_id": 5 }),
            result: json!({ "total": { "amount": "1500.00" } }),
            is_error: false,
        }];

        let text = evidence_context(&evidence);
        let line = r#"get_sales_summary {"employee_id":5} -> {"total":{"amount":"1500.00"}}"#;
        assert!(text.contains(line));
        assert!(evidence_context(&[]).contains("No tool data"));
    }
}
