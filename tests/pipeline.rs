mod common;

use std::sync::atomic::Ordering;

use common::{web_result, FakeSearch, Harness, USER_ID};
use film_series_bot::conversation::{Role, UserSession};
use film_series_bot::engine::{AnswerSource, FollowUp, EXPIRED_FOLLOW_UP_NOTICE};
use film_series_bot::error::BotError;
use film_series_bot::llm::{ChatRole, ImageAttachment};
use film_series_bot::prompts::{NO_CONTEXT_NOTICE, NO_INFORMATION_NOTICE};

#[tokio::test]
async fn test_follow_up_question_is_rewritten_with_history() {
    let h = Harness::new(&[], None).await;
    h.add_document(
        "oppenheimer.txt",
        "Oppenheimer (2023) was written by Christopher Nolan. The director shot it on IMAX film.",
    );
    h.documents.ingest_directory().await.unwrap();

    let mut session = UserSession::new(USER_ID);
    session.push_exchange(
        "Tell me about Oppenheimer",
        "**Oppenheimer** is a 2023 biographical drama.",
    );

    h.llm.reply("Who is the director of Oppenheimer?");
    h.llm.reply("**Christopher Nolan** directed it. 🎬");

    let reply = h
        .engine
        .respond(&mut session, "who is the director?")
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::Documents);
    assert!(reply.standalone_query.contains("Oppenheimer"));
    assert_eq!(reply.text, "**Christopher Nolan** directed it. 🎬");

    let calls = h.llm.calls();
    assert_eq!(calls.len(), 2);
    let rewrite_prompt = &calls[0].0.last().unwrap().content;
    assert!(rewrite_prompt.contains("User: Tell me about Oppenheimer"));
    assert!(rewrite_prompt.contains("Latest question: who is the director?"));
    assert_eq!(calls[0].1.temperature, 0.0);

    // The answer call carries the system prompt, the history and the retrieved chunk
    let (answer_messages, _) = &calls[1];
    assert_eq!(answer_messages[0].role, ChatRole::System);
    assert!(answer_messages.iter().any(|m| m.content == "Tell me about Oppenheimer"));
    assert!(h.llm.last_prompt().contains("The director shot it on IMAX film."));
    assert!(h.llm.last_prompt().contains("oppenheimer.txt"));

    assert_eq!(session.turns.len(), 4);
    assert_eq!(session.turns[2].content, "who is the director?");
    assert_eq!(session.turns[3].content, reply.text);
}

#[tokio::test]
async fn test_no_catalog_and_no_web_results_gives_no_information_notice() {
    let h = Harness::new(&[], Some(FakeSearch::with_results(Vec::new()))).await;
    let mut session = UserSession::new(USER_ID);

    let reply = h
        .engine
        .respond(&mut session, "Any comedy set in Paris on Netflix?")
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::NoInformation);
    assert_eq!(reply.text, NO_INFORMATION_NOTICE);
    assert_eq!(reply.offers, vec![FollowUp::Knowledge]);
    assert_eq!(h.llm.call_count(), 0);
    assert_eq!(
        h.search.as_ref().unwrap().queries(),
        vec!["Any comedy set in Paris on Netflix?"]
    );
    assert_eq!(
        session.pending_query.as_deref(),
        Some("Any comedy set in Paris on Netflix?")
    );

    h.llm.reply("From memory, *Emily in Paris* is a light pick.");
    let reply = h
        .engine
        .follow_up(&mut session, FollowUp::Knowledge)
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::Knowledge);
    assert!(h.llm.last_prompt().contains("Any comedy set in Paris on Netflix?"));
    assert!(session.pending_query.is_none());
    assert_eq!(session.turns.len(), 4);
}

#[tokio::test]
async fn test_empty_catalog_falls_back_to_web_results() {
    let results = vec![web_result("Dune: Part Two", "https://example.com/dune-part-two")];
    let h = Harness::new(&[], Some(FakeSearch::with_results(results))).await;
    let mut session = UserSession::new(USER_ID);

    h.llm.reply("**Dune: Part Two** is streaming now.");
    let reply = h
        .engine
        .respond(&mut session, "Where can I stream Dune by Villeneuve?")
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::Web);
    assert!(reply.offers.is_empty());
    assert_eq!(h.llm.call_count(), 1);
    assert!(h.llm.last_prompt().contains("URL: https://example.com/dune-part-two"));
}

#[tokio::test]
async fn test_unrelated_catalog_counts_as_no_context() {
    let h = Harness::new(&[], None).await;
    h.add_document("dune.txt", "Dune is Villeneuve's desert scifi epic.");
    h.documents.ingest_directory().await.unwrap();
    let mut session = UserSession::new(USER_ID);

    h.llm.reply("A classic Paris comedy is *Amélie*.");
    let reply = h
        .engine
        .respond(&mut session, "Suggest a comedy set in Paris")
        .await
        .unwrap();

    // No web search configured: answer from general knowledge
    assert_eq!(reply.source, AnswerSource::Knowledge);
    assert!(!h.llm.last_prompt().contains("desert scifi"));
}

#[tokio::test]
async fn test_failing_web_search_answers_from_knowledge() {
    let h = Harness::new(&[], Some(FakeSearch::failing())).await;
    let mut session = UserSession::new(USER_ID);

    h.llm.reply("From what I know, Heat came out in 1995.");
    let reply = h
        .engine
        .respond(&mut session, "When did Heat come out?")
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::Knowledge);
    assert_eq!(h.search.as_ref().unwrap().queries().len(), 1);
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn test_offer_policy_waits_for_the_users_choice() {
    let results = vec![web_result("Heat (1995)", "https://example.com/heat")];
    let h = Harness::new(
        &[("WEB_FALLBACK", "offer")],
        Some(FakeSearch::with_results(results)),
    )
    .await;
    let mut session = UserSession::new(USER_ID);

    let reply = h
        .engine
        .respond(&mut session, "Is Heat worth watching?")
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::NoContext);
    assert_eq!(reply.text, NO_CONTEXT_NOTICE);
    assert_eq!(reply.offers, vec![FollowUp::WebSearch, FollowUp::Knowledge]);
    assert_eq!(h.llm.call_count(), 0);
    assert!(h.search.as_ref().unwrap().queries().is_empty());

    h.llm.reply("**Heat** is a landmark crime thriller.");
    let reply = h
        .engine
        .follow_up(&mut session, FollowUp::WebSearch)
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::Web);
    assert_eq!(
        h.search.as_ref().unwrap().queries(),
        vec!["Is Heat worth watching?"]
    );
    assert!(session.pending_query.is_none());
    assert_eq!(session.turns.len(), 4);
}

#[tokio::test]
async fn test_offer_policy_without_search_only_offers_knowledge() {
    let h = Harness::new(&[("WEB_FALLBACK", "offer")], None).await;
    let mut session = UserSession::new(USER_ID);

    let reply = h
        .engine
        .respond(&mut session, "Is Heat worth watching?")
        .await
        .unwrap();

    assert_eq!(reply.offers, vec![FollowUp::Knowledge]);
}

#[tokio::test]
async fn test_follow_up_without_pending_query_expires() {
    let h = Harness::new(&[], None).await;
    let mut session = UserSession::new(USER_ID);

    let reply = h
        .engine
        .follow_up(&mut session, FollowUp::Knowledge)
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::Expired);
    assert_eq!(reply.text, EXPIRED_FOLLOW_UP_NOTICE);
    assert_eq!(h.llm.call_count(), 0);
    assert!(session.turns.is_empty());
}

#[tokio::test]
async fn test_retrieval_ranks_closest_chunks_first() {
    let h = Harness::new(&[], None).await;
    h.add_document("heat.txt", "Heat is a Michael Mann thriller.");
    h.add_document("heat_review.txt", "Heat: Mann's best thriller, a heat wave of a film.");
    h.add_document("dune.txt", "Dune is Villeneuve's desert scifi epic.");
    let report = h.documents.ingest_directory().await.unwrap();
    assert_eq!(report.files_ingested, 3);

    let results = h.store.query("mann heat thriller", 5).await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk.metadata.source, "heat.txt");
    assert_eq!(results[1].chunk.metadata.source, "heat_review.txt");
    assert!(results[0].score >= results[1].score);
    assert!(results.iter().all(|r| r.score >= h.config.min_relevance));
}

#[tokio::test]
async fn test_long_history_is_summarized_once() {
    let h = Harness::new(
        &[("MEMORY_TOKEN_LIMIT", "50"), ("MEMORY_KEEP_RECENT", "2")],
        None,
    )
    .await;
    let mut session = UserSession::new(USER_ID);
    for _ in 0..3 {
        session.push_exchange(
            "I loved the long tracking shots and the score in that film, \
what else is similar in tone and pacing?",
            "You might enjoy slow-burn thrillers with patient camera work \
and a brooding synth soundtrack.",
        );
    }
    let latest = session.turns[5].content.clone();

    h.llm.reply("The user likes slow-burn thrillers with long takes.");
    assert!(h.engine.summarize_if_needed(&mut session).await.unwrap());

    assert_eq!(session.turns.len(), 3);
    assert_eq!(session.turns[0].role, Role::Summary);
    assert_eq!(
        session.turns[0].content,
        "The user likes slow-burn thrillers with long takes."
    );
    assert_eq!(session.turns[2].content, latest);

    // Only the kept turns remain after the summary, nothing left to collapse
    assert!(!h.engine.summarize_if_needed(&mut session).await.unwrap());
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn test_model_failure_propagates() {
    let h = Harness::new(&[], None).await;
    let mut session = UserSession::new(USER_ID);

    h.llm.fail("HTTP 500");
    let err = h
        .engine
        .respond(&mut session, "Recommend a thriller")
        .await
        .unwrap_err();

    assert!(matches!(err, BotError::ExternalService { service: "openai", .. }));
    assert!(session.turns.is_empty());
}

#[tokio::test]
async fn test_image_question_uses_vision_model() {
    let h = Harness::new(&[], None).await;
    let mut session = UserSession::new(USER_ID);
    let image = ImageAttachment {
        bytes: vec![0xFF, 0xD8, 0xFF],
        mime_type: "image/jpeg".to_string(),
    };

    h.llm.reply("That looks like **Cillian Murphy**.");
    let reply = h
        .engine
        .analyze_image(&mut session, "Who is this actor?", image)
        .await
        .unwrap();

    assert_eq!(reply.source, AnswerSource::Vision);
    let calls = h.llm.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.model, h.config.vision_model);
    let last = calls[0].0.last().unwrap();
    assert!(last.image.is_some());
    assert!(last.content.contains("Who is this actor?"));
    assert_eq!(session.turns[0].content, "[image] Who is this actor?");
}

#[tokio::test]
async fn test_ingest_directory_skips_unusable_files() {
    let h = Harness::new(&[], None).await;
    h.add_document("notes.txt", "Heat is a thriller.");
    h.add_document("empty.txt", "   \n");
    std::fs::write(
        h.config.paths.documents_dir.join("poster.png"),
        [0x89, b'P', b'N', b'G'],
    )
    .unwrap();

    let report = h.documents.ingest_directory().await.unwrap();

    assert_eq!(report.files_ingested, 1);
    assert_eq!(report.chunks_added, 1);
    assert_eq!(report.skipped.len(), 2);
    assert!(report.skipped.iter().any(|(path, _)| path.ends_with("poster.png")));
    assert!(report.skipped.iter().any(|(path, _)| path.ends_with("empty.txt")));
    assert_eq!(h.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_embedding_failure_stores_nothing() {
    let h = Harness::new(&[], None).await;
    h.add_document("heat.txt", &"Heat is a Michael Mann thriller. ".repeat(100));
    h.embedder.fail.store(true, Ordering::SeqCst);

    let err = h.documents.ingest_directory().await.unwrap_err();

    assert!(matches!(err, BotError::Embedding(_)));
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_chunk_offsets_index_into_extracted_text() {
    let h = Harness::new(&[("CHUNK_SIZE", "40"), ("CHUNK_OVERLAP", "10")], None).await;
    let text = "\n  Heat is a Michael Mann thriller. Dune is Villeneuve's desert epic. \
Oppenheimer was directed by Nolan.";

    let chunks = h.documents.chunk_document("catalog.txt", text);

    assert!(chunks.len() > 2);
    for chunk in &chunks {
        let at: String = text
            .chars()
            .skip(chunk.metadata.char_offset)
            .take(chunk.content.chars().count())
            .collect();
        assert_eq!(at, chunk.content);
        assert_eq!(chunk.metadata.source, "catalog.txt");
    }
}
