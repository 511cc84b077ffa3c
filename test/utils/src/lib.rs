/// A single SSE frame carrying a completion delta, as the upstream emits it.
pub fn delta_frame(content: &str) -> String {
    let chunk = serde_json::json!({ "choices": [{ "delta": { "content": content } }] });
    return format!("data: {chunk}\n\n");
}

pub fn done_frame() -> &'static str {
    return "data: [DONE]\n\n";
}

pub fn sse_fixture() -> String {
    return [
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n".to_string(),
        delta_frame("Hello"),
        delta_frame(", "),
        delta_frame("world!"),
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n".to_string(),
        done_frame().to_string(),
    ]
    .join("");
}
