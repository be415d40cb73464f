use svcdir_adapters::parse_page;
use svcdir_core::{Job, JobSelectors};

const DIRECTORY_HTML: &str = r#"
<html><body>
  <div class="service">
    <h3>North West Hospital and Health Service</h3>
    <p class="desc">Public hospital and community health for the north west region.</p>
    <span class="addr">30 Camooweal Street, Mount Isa QLD 4825</span>
    <p>Phone: +61 7 4744 4444 &middot; <a href="mailto:nwhhs@health.qld.gov.au">email</a></p>
  </div>
  <div class="service">
    <h3>Mount Isa Youth Shelter</h3>
    <p class="desc">Crisis accommodation for young people.</p>
    <p>Call 0400 123 456</p>
  </div>
  <div class="banner">Not a service</div>
</body></html>
"#;

#[test]
fn custom_selectors_extract_directory_entries() {
    let mut job = Job::new("health-directory", "page", "https://health.example/directory");
    job.category = Some("health".into());
    job.selectors = Some(JobSelectors {
        item: Some("div.service".into()),
        name: Some("h3".into()),
        description: Some("p.desc".into()),
        address: Some("span.addr".into()),
    });

    let candidates = parse_page(DIRECTORY_HTML, &job).expect("parse");
    assert_eq!(candidates.len(), 2);

    let hospital = &candidates[0];
    assert_eq!(
        hospital.name.as_deref(),
        Some("North West Hospital and Health Service")
    );
    assert_eq!(
        hospital.address.as_deref(),
        Some("30 Camooweal Street, Mount Isa QLD 4825")
    );
    assert_eq!(hospital.phone.as_deref(), Some("(07) 4744 4444"));
    assert_eq!(hospital.email.as_deref(), Some("nwhhs@health.qld.gov.au"));
    assert_eq!(hospital.category.as_deref(), Some("health"));
    assert_eq!(hospital.metadata["extraction_method"], "page");

    let shelter = &candidates[1];
    assert_eq!(shelter.phone.as_deref(), Some("0400 123 456"));
    assert_eq!(shelter.address, None);
    assert_eq!(
        shelter.description.as_deref(),
        Some("Crisis accommodation for young people.")
    );
}
