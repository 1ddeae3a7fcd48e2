// ============================================================================
// SHARED PROMPT SECTIONS
// ============================================================================

use codechat_index::{QueryAnalysis, QueryType};

use crate::context::ContextStats;

pub const CONTEXT_OPEN: &str = "\n\n--- RETRIEVED CONTEXT ---\n";
pub const CONTEXT_CLOSE: &str = "--- END CONTEXT ---";

/// Maximum number of keywords echoed back as topic hints.
const MAX_TOPIC_HINTS: usize = 5;

const BASE_INSTRUCTIONS: &str = "\
You are CodeChat, an assistant that answers questions about a specific code repository. \
You are given excerpts of that repository retrieved from its code knowledge graph: files, \
classes and functions, each with a summary or code excerpt and a relevance score.

RULES:
1. Ground every statement about the repository in the retrieved context. If the context does \
not contain the answer, say so plainly instead of guessing.
2. Never invent files, classes, functions, parameters or behaviour that do not appear in the context.
3. Cite the nodes you rely on as `Kind: name` (for example `Function: parse_config`).
4. Prefer the higher-relevance nodes when the context contains conflicting hints.
5. Keep the answer structured: short paragraphs, bullet points where they help, code in fenced blocks.";

// ============================================================================
// PER-QUERY-TYPE TASK SECTIONS
// ============================================================================

const OVERVIEW_TASK: &str = "\
TASK: Give an overview of the code in question.
APPROACH:
1. Start with its main purpose
2. Describe the key components and what each is for
3. Explain how the components fit together";

const FUNCTIONALITY_TASK: &str = "\
TASK: Explain what the relevant functions or components do.
APPROACH:
1. State the primary purpose
2. Describe inputs, parameters and outputs
3. Walk through the steps it performs
4. Mention side effects and dependencies visible in the context";

const ARCHITECTURE_TASK: &str = "\
TASK: Explain the structure and design.
APPROACH:
1. Describe how files, classes and functions are organized
2. Explain which components own which responsibilities
3. Point out the dependencies between them";

const IMPLEMENTATION_TASK: &str = "\
TASK: Show how to use or implement the functionality asked about.
APPROACH:
1. Point to the relevant code
2. Explain the implementation approach
3. Give a short usage example based on the real signatures in the context";

const RELATIONSHIPS_TASK: &str = "\
TASK: Explain how the components relate to each other.
APPROACH:
1. Identify containment and call relationships visible in the context
2. Describe the data flow between the components
3. Call out anything that looks tightly coupled";

const COMPARISON_TASK: &str = "\
TASK: Compare the components asked about.
APPROACH:
1. Summarize each side
2. List the concrete differences and similarities
3. Say when one is preferable over the other, if the context supports it";

const DEBUGGING_TASK: &str = "\
TASK: Help locate and understand the problem.
APPROACH:
1. Identify the code most likely involved
2. Explain what could go wrong there
3. Suggest how to confirm the cause
4. Propose a fix grounded in the code shown";

const GENERAL_TASK: &str = "\
TASK: Answer the question directly from the retrieved context.
APPROACH:
1. Address the specific question first
2. Add supporting details from the context
3. Cite the nodes you used";

/// Task section for each query type.
pub fn task_instructions(query_type: QueryType) -> &'static str {
    match query_type {
        QueryType::Overview => OVERVIEW_TASK,
        QueryType::Functionality => FUNCTIONALITY_TASK,
        QueryType::Architecture => ARCHITECTURE_TASK,
        QueryType::Implementation => IMPLEMENTATION_TASK,
        QueryType::Relationships => RELATIONSHIPS_TASK,
        QueryType::Comparison => COMPARISON_TASK,
        QueryType::Debugging => DEBUGGING_TASK,
        QueryType::General => GENERAL_TASK,
    }
}

pub fn system_prompt(query_type: QueryType, stats: &ContextStats) -> String {
    format!(
        "{BASE_INSTRUCTIONS}\n\n\
CONTEXT STATISTICS:\n\
- Nodes provided: {total} (files: {files}, classes: {classes}, functions: {functions})\n\
- Relevance range: {min:.3} to {max:.3}, average {avg:.3}\n\n\
{task}",
        total = stats.total,
        files = stats.files,
        classes = stats.classes,
        functions = stats.functions,
        min = stats.min_score,
        max = stats.max_score,
        avg = stats.avg_score,
        task = task_instructions(query_type),
    )
}

pub fn user_message(query: &str, context: &str, analysis: &QueryAnalysis) -> String {
    let mut message = String::with_capacity(query.len() + context.len() + 128);
    message.push_str(query.trim());
    message.push_str(CONTEXT_OPEN);
    message.push_str(context);
    if !context.ends_with('\n') {
        message.push('\n');
    }
    message.push_str(CONTEXT_CLOSE);

    if analysis.query_type != QueryType::General {
        message.push_str(&format!(
            "\n\n[Query Type: {}]",
            title_case(analysis.query_type.label())
        ));
    }
    if !analysis.keywords.is_empty() {
        let topics: Vec<&str> = analysis
            .keywords
            .iter()
            .take(MAX_TOPIC_HINTS)
            .map(String::as_str)
            .collect();
        message.push_str(&format!("\n[Key Topics: {}]", topics.join(", ")));
    }
    message
}

fn title_case(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
