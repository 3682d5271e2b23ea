use confab_session::{AnalysisId, ProjectId, SessionId, UserId};
use confab_storage::{Database, ProjectStore, StorageError};

fn seeded() -> (Database, UserId, ProjectId) {
    let db = Database::open_in_memory().unwrap();
    let user = UserId::generate();
    db.upsert_user(user, "Ada Lovelace", "oidc|ada").unwrap();
    let project = db.create_project("Hiring loop", user).unwrap();
    (db, user, project)
}

#[test]
fn test_project_round_trip() {
    let (db, user, project_id) = seeded();
    let project = db.get_project(project_id).unwrap();
    assert_eq!(project.project_id, project_id);
    assert_eq!(project.name, "Hiring loop");
    assert_eq!(project.creator_user_id, user);
}

#[test]
fn test_get_missing_project_is_not_found() {
    let (db, _, _) = seeded();
    let missing = db.get_project(ProjectId::generate());
    assert!(matches!(missing, Err(StorageError::NotFound(_))));
}

#[test]
fn test_upsert_user_returns_canonical_id_on_subject_conflict() {
    let (db, user, _) = seeded();
    // Same OIDC subject, new display name: the original id wins.
    let canonical = db
        .upsert_user(UserId::generate(), "Ada L.", "oidc|ada")
        .unwrap();
    assert_eq!(canonical, user);
}

#[test]
fn test_transcripts_come_back_in_creation_order() {
    let (db, user, project) = seeded();
    let session = SessionId::generate();

    let mut ids = Vec::new();
    for text in ["first", "second", "third"] {
        ids.push(
            db.append_transcript(user, session, project, text)
                .unwrap(),
        );
    }

    let rows = db.transcripts_for_project(project).unwrap();
    assert_eq!(
        rows.iter().map(|r| r.transcript_id).collect::<Vec<_>>(),
        ids
    );
    assert_eq!(
        rows.iter().map(|r| r.text.as_str()).collect::<Vec<_>>(),
        vec!["first", "second", "third"]
    );
    assert!(rows.iter().all(|r| r.session_id == session));
}

#[test]
fn test_transcripts_scoped_to_project() {
    let (db, user, project) = seeded();
    let other = db.create_project("Other", user).unwrap();
    let session = SessionId::generate();

    db.append_transcript(user, session, project, "mine").unwrap();
    db.append_transcript(user, session, other, "theirs").unwrap();

    let rows = db.transcripts_for_project(project).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].text, "mine");
}

#[test]
fn test_dismissed_analyses_drop_out_of_listing() {
    let (db, user, project) = seeded();

    let kept = db
        .append_analysis(project, "Ask about ownership", Some("0:120"))
        .unwrap();
    let dismissed = db
        .append_analysis(project, "Ask about scale", None)
        .unwrap();

    db.dismiss_analysis(dismissed, user).unwrap();

    let rows = db.analyses_for_project(project).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].analysis_id, kept);
    assert_eq!(rows[0].span.as_deref(), Some("0:120"));
}

#[test]
fn test_dismiss_unknown_analysis_is_not_found() {
    let (db, user, _) = seeded();
    let result = db.dismiss_analysis(AnalysisId::generate(), user);
    assert!(matches!(result, Err(StorageError::NotFound(_))));
}
