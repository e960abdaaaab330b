use sanctions_watch::config::SourceConfig;
use sanctions_watch::fetcher::ReqwestFetcher;
use sanctions_watch::orchestrator::Orchestrator;
use sanctions_watch::parser::ParserKind;
use sanctions_watch::storage::{EntityFilter, SqliteStorage, Storage};
use sanctions_watch::types::{ChangeType, RunStatus};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OFAC_CSV: &str = "name,program,country\nAcme Corp,SDN,RU\n";

const BIS_HTML: &str = r#"<html><body><table>
<tr><th>Country</th><th>Entity</th><th>Federal Register Citation</th></tr>
<tr><td>CHINA</td><td>Globex Ltd</td><td>85 FR 34495</td></tr>
<tr><td>IRAN</td><td>Initech &amp; Partners</td><td>86 FR 1000</td></tr>
</table></body></html>"#;

async fn publishers() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ofac/sdn.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(OFAC_CSV))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bis/entity-list"))
        .respond_with(ResponseTemplate::new(200).set_body_string(BIS_HTML))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/eu/list.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7\x00\x01binary".to_vec()))
        .mount(&server)
        .await;
    server
}

fn sources(base: &str) -> Vec<SourceConfig> {
    vec![
        SourceConfig::new("OFAC", &format!("{base}/ofac/sdn.csv"), ParserKind::Delimited),
        SourceConfig::new("BIS", &format!("{base}/bis/entity-list"), ParserKind::HtmlTable),
        SourceConfig::new("EU", &format!("{base}/eu/list.pdf"), ParserKind::Opaque),
    ]
}

fn orchestrator(storage: Arc<dyn Storage>) -> Orchestrator {
    let fetcher = ReqwestFetcher::new(Duration::from_secs(5)).unwrap();
    Orchestrator::new(storage, Arc::new(fetcher))
}

#[tokio::test]
async fn ofac_scenario_twice_against_sqlite() {
    let server = publishers().await;
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("watch.db")).unwrap());
    let ofac = vec![sources(&server.uri()).remove(0)];

    let first = orchestrator(storage.clone()).run_all(&ofac).await.unwrap();
    let entity = storage.get_entity("OFAC:Acme Corp").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = orchestrator(storage.clone()).run_all(&ofac).await.unwrap();

    for summary in [&first, &second] {
        assert!(summary.success);
        assert_eq!(summary.sources[0].status, RunStatus::Ok);
        assert_eq!(summary.sources[0].rows, 1);
    }
    assert!(first.sources[0].changed);
    assert!(!second.sources[0].changed);

    assert_eq!(storage.list_snapshots("OFAC").await.unwrap().len(), 1);
    let log = storage.list_change_log("OFAC").await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].change_type, ChangeType::Insert);

    let entities = storage.list_entities(&EntityFilter::default()).await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].entity_key, "OFAC:Acme Corp");
    assert_eq!(entities[0].program.as_deref(), Some("SDN"));
    assert_eq!(entities[0].first_seen, entity.first_seen);
    assert!(entities[0].last_seen > entity.last_seen);

    let runs = storage.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Ok && r.rows == 1));
}

#[tokio::test]
async fn all_three_parsers_in_one_invocation() {
    let server = publishers().await;
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("watch.db")).unwrap());

    let summary = orchestrator(storage.clone())
        .run_all(&sources(&server.uri()))
        .await
        .unwrap();
    assert!(summary.success);
    assert_eq!(summary.ok, 3);

    let bis = storage
        .list_entities(&EntityFilter {
            source: Some("BIS".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let names: Vec<_> = bis.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["Globex Ltd", "Initech & Partners"]);

    let iran = storage
        .list_entities(&EntityFilter {
            source: Some("BIS".into()),
            country: Some("iran".into()),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(iran.len(), 1);

    let eu = summary.sources.iter().find(|r| r.source == "EU").unwrap();
    assert_eq!(eu.rows, 0);
    assert!(eu.changed);
    assert_eq!(storage.list_snapshots("EU").await.unwrap().len(), 1);
}

#[tokio::test]
async fn middle_source_outage_is_isolated() {
    let server = publishers().await;
    let outage = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(4096)))
        .mount(&outage)
        .await;

    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("watch.db")).unwrap());
    let mut configured = sources(&server.uri());
    configured[1].url = format!("{}/bis/entity-list", outage.uri());

    let summary = orchestrator(storage.clone()).run_all(&configured).await.unwrap();
    assert!(!summary.success);
    let statuses: Vec<_> = summary.sources.iter().map(|r| r.status).collect();
    assert_eq!(statuses, [RunStatus::Ok, RunStatus::Error, RunStatus::Ok]);

    let bis = &summary.sources[1];
    let run = storage.get_run(bis.run_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Error);
    let detail = run.error.unwrap();
    assert!(detail.contains("500"));
    assert!(detail.len() < 1024, "error body should be truncated");
    assert!(storage.list_snapshots("BIS").await.unwrap().is_empty());

    for run in storage.recent_runs(10).await.unwrap() {
        assert_ne!(run.status, RunStatus::Running);
    }
}

#[tokio::test]
async fn quoted_csv_field_is_one_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "name,program,country\n\"Smith, John\",\"OFAC Program\",\"RU\"\n",
        ))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("watch.db")).unwrap());
    let ofac = SourceConfig::new("OFAC", &format!("{}/sdn.csv", server.uri()), ParserKind::Delimited);

    let report = orchestrator(storage.clone()).run_source(&ofac).await;
    assert_eq!(report.status, RunStatus::Ok);
    assert_eq!(report.rows, 1);
    let entity = storage.get_entity("OFAC:Smith, John").await.unwrap().unwrap();
    assert_eq!(entity.program.as_deref(), Some("OFAC Program"));
    assert_eq!(entity.country.as_deref(), Some("RU"));
}
