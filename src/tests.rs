#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::json;

    use crate::document::{
        Cell, CellValue, Chart, ChartSeries, ChartValue, Geometry, Paragraph, SheetRow, Shape, ShapeKind, Slide,
        Table, TableCell, TableRow, TextFrame, TextRun, Worksheet,
    };
    use crate::errors::FetchError;
    use crate::{
        Context, FetchedImage, ImageFetcher, PermissionChecker, Presentation, Record, RenderConfig, Renderer, Value, Workbook,
    };

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 1];

    fn init() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Trace)
            .try_init();
    }

    #[derive(Debug)]
    struct Person {
        name: &'static str,
        email: &'static str,
        active: bool,
    }

    impl Record for Person {
        fn field(&self, name: &str) -> Option<Value> {
            match name {
                "name" => Some(self.name.into()),
                "email" => Some(self.email.into()),
                "is_active" => Some(self.active.into()),
                _ => None,
            }
        }

        fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, String>> {
            match method {
                "greet" => Some(match args.first() {
                    Some(greeting) => Ok(format!("Good {}, {}", greeting, self.name).into()),
                    None => Err("greet needs a greeting".to_string()),
                }),
                _ => None,
            }
        }

        fn display(&self) -> String {
            self.name.to_string()
        }
    }

    /// Serves PNG bytes for `https://img/` URLs, times out on `https://slow/` and
    /// returns garbage for everything else. Records the timeout of every request.
    #[derive(Default)]
    struct StubFetcher {
        timeouts: Arc<Mutex<Vec<Duration>>>,
    }

    impl ImageFetcher for StubFetcher {
        fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedImage, FetchError> {
            self.timeouts.lock().unwrap().push(timeout);
            if url.starts_with("https://img/") {
                let mut bytes = PNG.to_vec();
                bytes.extend_from_slice(url.as_bytes());
                crate::core::images::to_image(url, bytes)
            } else if url.starts_with("https://slow/") {
                Err(FetchError::Timeout { url: url.to_string() })
            } else {
                crate::core::images::to_image(url, b"<html>not found</html>".to_vec())
            }
        }
    }

    fn fixed_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(14, 7, 9).unwrap()
    }

    fn config() -> RenderConfig {
        let mut config = RenderConfig::default();
        config.set_now(fixed_now());
        config
    }

    fn renderer() -> Renderer {
        Renderer::new(config())
    }

    fn users() -> Context {
        Context::from(json!({
            "title": "Quarterly review",
            "users": [
                { "name": "Alice", "email": "a@x.com", "is_active": true },
                { "name": "Bob", "email": "b@x.com", "is_active": false },
            ],
            "orders": [ { "id": 1, "total": 9.5 }, { "id": 2, "total": 20 }, { "id": 3, "total": 7.25 } ],
        }))
    }

    fn text_shape(name: &str, text: &str) -> Shape {
        Shape { id: 0, name: name.to_string(), geometry: Geometry::default(), kind: ShapeKind::Text(TextFrame::from_text(text)) }
    }

    fn table_shape(rows: &[&[&str]]) -> Shape {
        let rows = rows
            .iter()
            .map(|cells| TableRow { height: 370840, cells: cells.iter().map(|text| TableCell::new(text)).collect() })
            .collect();
        Shape { id: 0, name: "Table".to_string(), geometry: Geometry::default(), kind: ShapeKind::Table(Table { rows }) }
    }

    fn slide(shapes: Vec<Shape>) -> Slide {
        Slide { id: 0, shapes }
    }

    fn texts(slide: &Slide) -> Vec<String> {
        slide
            .shapes
            .iter()
            .filter_map(|shape| match &shape.kind {
                ShapeKind::Text(frame) => Some(frame.text()),
                _ => None,
            })
            .collect()
    }

    fn table(slide: &Slide) -> &Table {
        slide
            .shapes
            .iter()
            .find_map(|shape| match &shape.kind {
                ShapeKind::Table(table) => Some(table),
                _ => None,
            })
            .expect("slide has a table")
    }

    fn column(table: &Table, column: usize) -> Vec<String> {
        table.rows.iter().map(|row| row.cells[column].text()).collect()
    }

    fn render_text(text: &str, context: &Context) -> String {
        let output = renderer().render_text(text, context).unwrap();
        println!("{:?} => {:?}", text, output.document);
        output.document
    }

    #[test]
    fn test_scalar_with_case_format() {
        init();

        let context: Context = [("name", "alice")].into_iter().collect();
        assert_eq!(render_text("Hello {{ name | upper }}!", &context), "Hello ALICE!");
        assert_eq!(render_text("{{ name | capitalize }}", &context), "Alice");

        let context: Context = [("name", "hELLO wORLD")].into_iter().collect();
        assert_eq!(render_text("{{ name | title }}", &context), "Hello World");
        assert_eq!(render_text("{{ name | lower }}", &context), "hello world");
    }

    #[test]
    fn test_numeric_formats() {
        init();

        let context = Context::from(json!({
            "amount": 123.456,
            "cheap": 0.125,
            "odd": 0.135,
            "tiny": -0.001,
            "big": 1234567.891,
            "price": 9.99,
            "loss": -9.99,
            "count": 1234567,
        }));
        assert_eq!(render_text("{{ amount | .2f }}", &context), "123.46");
        assert_eq!(render_text("{{ cheap | .2f }}", &context), "0.12");
        assert_eq!(render_text("{{ odd | .2f }}", &context), "0.14");
        assert_eq!(render_text("{{ tiny | .2f }}", &context), "0.00");
        assert_eq!(render_text("{{ big | ,.2f }}", &context), "1,234,567.89");
        assert_eq!(render_text("{{ price | d }}", &context), "9");
        assert_eq!(render_text("{{ loss | d }}", &context), "-9");
        assert_eq!(render_text("{{ count | ,d }}", &context), "1,234,567");
    }

    #[test]
    fn test_format_errors_are_marked_inline() {
        use crate::errors::{RenderError, ResolutionErrorKind};

        init();

        let context: Context = [("name", "alice")].into_iter().collect();
        let output = renderer().render_text("{{ name | bogus }}", &context).unwrap();
        println!("{:?}", output);
        assert!(output.document.starts_with("[ERROR: "));
        assert_eq!(output.diagnostics.len(), 1);
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Resolution { source, .. } if matches!(source.kind, ResolutionErrorKind::UnknownFormat { .. })
        ));

        let output = renderer().render_text("{{ name | .2f }}", &context).unwrap();
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Resolution { source, .. } if matches!(source.kind, ResolutionErrorKind::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_date_formats() {
        init();

        let context = Context::from(json!({ "due": "2024-01-15" }));
        assert_eq!(render_text("{{ now | MMMM dd, YYYY }}", &context), "March 05, 2024");
        assert_eq!(render_text("{{ now | \"%Y-%m-%d\" }}", &context), "2024-03-05");
        assert_eq!(render_text("{{ now | dddd }}", &context), "Tuesday");
        assert_eq!(render_text("{{ now | h:mm tt }}", &context), "2:07 PM");
        assert_eq!(render_text("{{ due | dd/MM/YYYY }}", &context), "15/01/2024");

        let mut config = config();
        config.set_date_locale("fr_FR");
        let output = Renderer::new(config).render_text("{{ now | dd MMMM YYYY }}", &context).unwrap();
        println!("{:?}", output.document);
        assert_eq!(output.document, "05 mars 2024");
    }

    #[test]
    fn test_now_can_be_shadowed() {
        init();

        let context: Context = [("now", "yesterday")].into_iter().collect();
        assert_eq!(render_text("{{ now }}", &context), "yesterday");
    }

    #[test]
    fn test_filter_and_projection() {
        use crate::config::RenderSettings;
        use crate::context::Scope;
        use crate::core::Evaluator;

        init();

        let context = users();
        let settings = RenderSettings::from_config(&config()).unwrap();
        let scope = Scope::new(&context);
        let evaluator = Evaluator::new(&scope, &settings);

        let active = evaluator.evaluate("users[is_active=True].email").unwrap();
        println!("{:?}", active);
        assert_eq!(active, Value::List(vec!["a@x.com".into()]));
        assert_eq!(evaluator.evaluate("users[is_active==True].email").unwrap(), active);

        let names = evaluator.evaluate("users.name").unwrap();
        assert_eq!(names, Value::List(vec!["Alice".into(), "Bob".into()]));

        let none = evaluator.evaluate("users[is_active=True, name=Bob]").unwrap();
        assert_eq!(none, Value::List(Vec::new()));

        assert_eq!(render_text("Active: {{ users[is_active=true].name }}", &context), "Active: Alice");
        assert_eq!(render_text("{{ users.email }}", &context), "a@x.com, b@x.com");
    }

    #[test]
    fn test_filter_on_scalar_is_an_error() {
        use crate::errors::{RenderError, ResolutionErrorKind};

        init();

        let output = renderer().render_text("{{ title[x=1] }}", &users()).unwrap();
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Resolution { source, .. } if matches!(source.kind, ResolutionErrorKind::NotASequence { .. })
        ));
    }

    #[test]
    fn test_nested_placeholder_and_method_call() {
        init();

        let mut context = Context::new();
        let person: Arc<dyn Record> = Arc::new(Person { name: "Alice", email: "a@x.com", active: true });
        context.insert("user", person).insert("time_of_day", "Morning");

        assert_eq!(render_text("{{ user.greet($time_of_day$) }}", &context), "Good Morning, Alice");
        assert_eq!(render_text("{{ user.greet('Evening') }}", &context), "Good Evening, Alice");
        assert_eq!(render_text("{{ user }}", &context), "Alice");
        assert_eq!(render_text("{{ user.is_active }}", &context), "true");
    }

    #[test]
    fn test_call_errors() {
        use crate::errors::{RenderError, ResolutionErrorKind};

        init();

        let mut context = Context::new();
        let person: Arc<dyn Record> = Arc::new(Person { name: "Alice", email: "a@x.com", active: true });
        context.insert("user", person);

        let output = renderer().render_text("{{ user.name() }} / {{ user.greet() }}", &context).unwrap();
        println!("{:?}", output.document);
        let kinds: Vec<&ResolutionErrorKind> = output
            .diagnostics
            .errors()
            .iter()
            .filter_map(|e| match e {
                RenderError::Resolution { source, .. } => Some(&source.kind),
                _ => None,
            })
            .collect();
        assert!(matches!(kinds[0], ResolutionErrorKind::NotCallable { .. }));
        assert!(matches!(kinds[1], ResolutionErrorKind::CallFailed { .. }));
    }

    /// Refuses every record whose display name contains "deny".
    #[derive(Debug)]
    struct DenyNamed;

    impl PermissionChecker for DenyNamed {
        fn can_view(&self, record: &dyn Record) -> bool {
            !record.display().to_lowercase().contains("deny")
        }
    }

    #[test]
    fn test_permission_checks() {
        use crate::errors::{RenderError, ResolutionErrorKind};

        init();

        let people: Vec<Value> = [
            Person { name: "Alice", email: "a@x.com", active: true },
            Person { name: "Bob", email: "b@x.com", active: true },
            Person { name: "DenyUser", email: "deny@x.com", active: true },
        ]
        .into_iter()
        .map(|person| Value::Object(Arc::new(person)))
        .collect();
        let mut context = Context::new();
        context.insert("users", people.clone()).insert("user", people[0].clone());

        let output = renderer().with_permission_checker(DenyNamed).render_text("{{ user.email }}", &context).unwrap();
        assert_eq!(output.document, "a@x.com");
        assert!(output.is_clean());

        let output = renderer()
            .with_permission_checker(DenyNamed)
            .render_text("Emails: {{ users.email }}", &context)
            .unwrap();
        println!("{:?}", output);
        assert!(output.document.starts_with("Emails: [ERROR: "));
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Resolution { source, .. }
                if source.kind == ResolutionErrorKind::PermissionDenied { object: "DenyUser".to_string() }
        ));

        let mut config = config();
        config.set_check_permissions(false);
        let output = Renderer::new(config.clone())
            .with_permission_checker(DenyNamed)
            .render_text("{{ users.email }}", &context)
            .unwrap();
        assert_eq!(output.document, "a@x.com, b@x.com, deny@x.com");

        config.set_check_permissions(true).set_fail_fast(true);
        let result = Renderer::new(config).with_permission_checker(DenyNamed).render_text("{{ users.name }}", &context);
        assert!(matches!(
            result,
            Err(RenderError::Resolution { source, .. }) if matches!(source.kind, ResolutionErrorKind::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_double_underscore_paths() {
        init();

        let context = Context::from(json!({
            "user": { "profile": { "email": "a@x.com", "city": "Oslo" } },
            "manager": null,
        }));
        assert_eq!(render_text("{{ user__profile__email }}", &context), "a@x.com");
        assert_eq!(render_text("{{ user.profile__city }}", &context), "Oslo");
        assert_eq!(render_text("[{{ manager.name }}]", &context), "[]");
    }

    #[test]
    fn test_missing_attribute() {
        use crate::errors::{Location, RenderError, ResolutionErrorKind};

        init();

        let context = users();
        let output = renderer().render_text("Hi {{ title.missing }}", &context).unwrap();
        println!("{:?}", output);
        assert!(!output.is_clean());
        assert!(output.document.starts_with("Hi [ERROR: "));

        let output = renderer().render_text("Hi {{ nobody }}", &context).unwrap();
        assert!(output.document.contains("nobody"));

        let mut config = config();
        config.set_fail_fast(true);
        let result = Renderer::new(config).render_text("Hi {{ nobody }}", &context);
        match result {
            Err(RenderError::Resolution { location, source }) => {
                assert_eq!(location, Location::Text);
                assert_eq!(source.placeholder, "{{ nobody }}");
                assert!(matches!(source.kind, ResolutionErrorKind::UnknownAttribute { .. }));
            }
            other => panic!("expected a resolution error, got {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic() {
        use crate::errors::{RenderError, ResolutionErrorKind};

        init();

        let context = Context::from(json!({ "price": 2.5, "quantity": 4, "total": 10, "amounts": [1, 2, 3], "name": "x" }));
        assert_eq!(render_text("{{ price * quantity }}", &context), "10");
        assert_eq!(render_text("{{ total / 4 }}", &context), "2.5");
        assert_eq!(render_text("{{ 8 / 2 }}", &context), "4");
        assert_eq!(render_text("{{ 7 / 2 }}", &context), "3.5");
        assert_eq!(render_text("{{ 2 + 3 * 4 }}", &context), "14");
        assert_eq!(render_text("{{ (2 + 3) * 4 }}", &context), "20");
        assert_eq!(render_text("{{ total - quantity - 1 }}", &context), "5");
        assert_eq!(render_text("{{ amounts * 2 }}", &context), "2, 4, 6");
        assert_eq!(render_text("{{ price * quantity | .2f }}", &context), "10.00");

        let output = renderer().render_text("{{ total / 0 }}", &context).unwrap();
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Resolution { source, .. } if source.kind == ResolutionErrorKind::DivisionByZero
        ));

        let output = renderer().render_text("{{ name + 1 }}", &context).unwrap();
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Resolution { source, .. } if matches!(source.kind, ResolutionErrorKind::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_literals_and_escapes() {
        use crate::core::literal::{coerce, loosely_equal};
        use crate::types::Number;

        init();

        assert_eq!(coerce("42"), Value::Number(Number::Int(42)));
        assert_eq!(coerce("4.5"), Value::Number(Number::Float(4.5)));
        assert_eq!(coerce("True"), Value::Boolean(true));
        assert_eq!(coerce("None"), Value::Null);
        assert_eq!(coerce("'42'"), Value::String("42".to_string()));
        assert_eq!(coerce("abc"), Value::String("abc".to_string()));
        assert!(loosely_equal(&Value::from("1"), &Value::from(1)));
        assert!(loosely_equal(&Value::from(2.0), &Value::from(2)));
        assert!(!loosely_equal(&Value::from("yes"), &Value::from(true)));

        let context = Context::new();
        assert_eq!(render_text("{{ '{{' }} literal {{ \"}}\" }}", &context), "{{ literal }}");
        assert_eq!(render_text("100% sure, %loopy and % loop x in y%", &context), "100% sure, %loopy and % loop x in y%");
        assert_eq!(render_text("{{ \"US$\" }}", &context), "US$");
        assert_eq!(render_text("{{ '$x$' }}", &context), "$x$");
    }

    #[test]
    fn test_parse_errors_always_abort() {
        use crate::errors::{ParseError, RenderError};

        init();

        let context = users();
        let result = renderer().render_text("Hello {{ name", &context);
        println!("{:?}", result);
        assert!(matches!(
            result,
            Err(RenderError::Parse { source: ParseError::Unterminated { delimiter: "{{", offset: 6, .. }, .. })
        ));

        let result = renderer().render_text("Hello {{ }}", &context);
        assert!(matches!(result, Err(RenderError::Parse { source: ParseError::EmptyPlaceholder { .. }, .. })));

        let result = renderer().render_text("{{ a { b }}", &context);
        assert!(matches!(result, Err(RenderError::Parse { source: ParseError::StrayBrace { .. }, .. })));

        let result = renderer().render_text("{{ user.greet($time }}", &context);
        assert!(matches!(result, Err(RenderError::Parse { source: ParseError::Unterminated { delimiter: "$", .. }, .. })));

        let result = renderer().render_text("Before %loop u in users% after", &context);
        assert!(matches!(result, Err(RenderError::Parse { source: ParseError::MisplacedDirective { .. }, .. })));
    }

    #[test]
    fn test_tokenize() {
        use crate::parser::{tokenize, Token};

        init();

        let tokens = tokenize("Hi {{ a }} %loop u in users% x %endloop%").unwrap();
        println!("{:?}", tokens);
        assert_eq!(tokens.len(), 6);
        assert!(matches!(&tokens[1], Token::Placeholder { body, offset: 3, .. } if body == " a "));
        assert!(matches!(&tokens[3], Token::LoopStart { variable, collection, .. } if variable == "u" && collection == "users"));
        assert!(matches!(&tokens[5], Token::LoopEnd { .. }));

        let tokens = tokenize("%image% https://img/$user.id$.png").unwrap();
        assert!(matches!(&tokens[0], Token::Image { source, .. } if source == "https://img/$user.id$.png"));
    }

    #[test]
    fn test_split_runs_are_merged() {
        use crate::render::pptx::merge_split_runs;

        init();

        let bold = json!({ "bold": true }).as_object().cloned().unwrap();
        let mut paragraph = Paragraph {
            runs: vec![
                TextRun { text: "Hello {{ us".to_string(), style: bold.clone() },
                TextRun::new("er.name }}"),
                TextRun::new("!"),
            ],
        };
        merge_split_runs(&mut paragraph).unwrap();
        println!("{:?}", paragraph);
        assert_eq!(paragraph.runs.len(), 2);
        assert_eq!(paragraph.runs[0].text, "Hello {{ user.name }}");
        assert_eq!(paragraph.runs[0].style, bold);
        assert_eq!(paragraph.runs[1].text, "!");

        let template = Presentation {
            slides: vec![slide(vec![Shape {
                id: 1,
                name: "Title".to_string(),
                geometry: Geometry::default(),
                kind: ShapeKind::Text(TextFrame {
                    paragraphs: vec![Paragraph { runs: vec![TextRun::new("Hi {{ ti"), TextRun::new("tle }}")] }],
                }),
            }])],
        };
        let output = renderer().render_presentation(&template, &users()).unwrap();
        assert_eq!(texts(&output.document.slides[0]), vec!["Hi Quarterly review"]);

        let mut broken = Paragraph { runs: vec![TextRun::new("{{ name"), TextRun::new(" and more")] };
        assert!(merge_split_runs(&mut broken).is_err());
    }

    #[test]
    fn test_table_expansion_reuses_blank_rows() {
        init();

        let mut shape = table_shape(&[&["Id"], &["{{ orders.id }}"], &[""], &["Total"]]);
        if let ShapeKind::Table(table) = &mut shape.kind {
            table.rows[1].cells[0].style = json!({ "fill": "EEEEEE" }).as_object().cloned().unwrap();
        }
        let template = Presentation { slides: vec![slide(vec![text_shape("Title", "Orders"), shape])] };

        let output = renderer().render_presentation(&template, &users()).unwrap();
        let table = table(&output.document.slides[0]);
        println!("{:?}", column(table, 0));
        assert_eq!(column(table, 0), vec!["Id", "1", "2", "3", "Total"]);
        assert_eq!(table.rows[3].cells[0].style, table.rows[1].cells[0].style);
        assert_eq!(table.rows[3].height, 370840);
        assert!(output.is_clean());
    }

    #[test]
    fn test_table_expansion_fills_parallel_columns() {
        init();

        let template = Presentation {
            slides: vec![slide(vec![
                text_shape("Title", "{{ title }}"),
                table_shape(&[&["Id", "Total"], &["{{ orders.id }}", "{{ orders.total | .2f }}"]]),
            ])],
        };
        let output = renderer().render_presentation(&template, &users()).unwrap();
        let table = table(&output.document.slides[0]);
        assert_eq!(column(table, 0), vec!["Id", "1", "2", "3"]);
        assert_eq!(column(table, 1), vec!["Total", "9.50", "20.00", "7.25"]);
    }

    #[test]
    fn test_empty_list_removes_row() {
        init();

        let context = Context::from(json!({ "orders": [] }));
        let template = Presentation {
            slides: vec![slide(vec![
                text_shape("Title", "Orders"),
                table_shape(&[&["Id", "Total"], &["{{ orders.id }}", "{{ orders.total }}"], &["Sum", "0"]]),
            ])],
        };
        let output = renderer().render_presentation(&template, &context).unwrap();
        let table = table(&output.document.slides[0]);
        assert_eq!(column(table, 0), vec!["Id", "Sum"]);
        assert_eq!(column(table, 1), vec!["Total", "0"]);
    }

    #[test]
    fn test_single_element_list_matches_scalar() {
        init();

        let context = Context::from(json!({ "orders": [ { "id": 7 } ], "order": { "id": 7 } }));
        let from_list = Presentation { slides: vec![slide(vec![text_shape("T", "x"), table_shape(&[&["{{ orders.id }}"]])])] };
        let from_scalar = Presentation { slides: vec![slide(vec![text_shape("T", "x"), table_shape(&[&["{{ order.id }}"]])])] };

        let a = renderer().render_presentation(&from_list, &context).unwrap();
        let b = renderer().render_presentation(&from_scalar, &context).unwrap();
        assert_eq!(a.document, b.document);
    }

    #[test]
    fn test_ambiguous_table_cell() {
        use crate::errors::{RenderError, ResolutionErrorKind};

        init();

        let template = Presentation {
            slides: vec![slide(vec![text_shape("T", "x"), table_shape(&[&["{{ orders.id }} - {{ title }}"]])])],
        };
        let output = renderer().render_presentation(&template, &users()).unwrap();
        let table = table(&output.document.slides[0]);
        assert_eq!(table.rows.len(), 1);
        assert!(table.rows[0].cells[0].text().starts_with("[ERROR: "));
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Resolution { source, .. } if source.kind == ResolutionErrorKind::AmbiguousExpansion { count: 2 }
        ));
    }

    #[test]
    fn test_vertically_merged_row_cannot_be_cloned() {
        use crate::errors::{ExpansionError, RenderError};

        init();

        let mut shape = table_shape(&[&["{{ orders.id }}", "note"], &["", ""]]);
        if let ShapeKind::Table(table) = &mut shape.kind {
            table.rows[0].cells[1].row_span = 2;
            table.rows[1].cells[1].merged = true;
        }
        let template = Presentation { slides: vec![slide(vec![text_shape("T", "x"), shape])] };
        let result = renderer().render_presentation(&template, &users());
        println!("{:?}", result);
        assert!(matches!(
            result,
            Err(RenderError::Expansion { source: ExpansionError::InvalidCloneTarget { row: 0, .. }, .. })
        ));
    }

    #[test]
    fn test_merged_row_is_not_removed_for_empty_list() {
        use crate::errors::{ExpansionError, RenderError};

        init();

        let mut shape = table_shape(&[&["{{ orders.id }}", "note"], &["", ""]]);
        if let ShapeKind::Table(table) = &mut shape.kind {
            table.rows[0].cells[1].row_span = 2;
            table.rows[1].cells[1].merged = true;
        }
        let template = Presentation { slides: vec![slide(vec![text_shape("T", "x"), shape])] };
        let context = Context::from(json!({ "orders": [] }));
        let result = renderer().render_presentation(&template, &context);
        println!("{:?}", result);
        assert!(matches!(
            result,
            Err(RenderError::Expansion { source: ExpansionError::UnremovableRow { row: 0, .. }, .. })
        ));

        let mut shape = table_shape(&[&["Id", "note"], &["{{ orders.id }}", ""]]);
        if let ShapeKind::Table(table) = &mut shape.kind {
            table.rows[0].cells[1].row_span = 2;
            table.rows[1].cells[1].merged = true;
        }
        let template = Presentation { slides: vec![slide(vec![text_shape("T", "x"), shape])] };
        let result = renderer().render_presentation(&template, &context);
        assert!(matches!(
            result,
            Err(RenderError::Expansion { source: ExpansionError::UnremovableRow { row: 1, .. }, .. })
        ));
    }

    fn loop_template() -> Presentation {
        Presentation {
            slides: vec![
                slide(vec![text_shape("Title", "Intro")]),
                slide(vec![text_shape("Start", "%loop user in users%"), text_shape("Header", "Profile of {{ user.name }}")]),
                slide(vec![text_shape("Email", "{{ user.email }}"), text_shape("Caption", "{{ loop_number }} of {{ loop_count }}")]),
                slide(vec![text_shape("End", "%endloop%"), text_shape("Footer", "End of {{ user.name }}")]),
                slide(vec![text_shape("Title", "Outro")]),
            ],
        }
    }

    #[test]
    fn test_loop_keeps_marker_slides() {
        init();

        let output = renderer().render_presentation(&loop_template(), &users()).unwrap();
        let slides: Vec<Vec<String>> = output.document.slides.iter().map(texts).collect();
        println!("{:#?}", slides);
        assert_eq!(slides.len(), 8);
        assert_eq!(slides[0], vec!["Intro"]);
        assert_eq!(slides[1], vec!["Profile of Alice"]);
        assert_eq!(slides[2], vec!["a@x.com", "1 of 2"]);
        assert_eq!(slides[3], vec!["End of Alice"]);
        assert_eq!(slides[4], vec!["Profile of Bob"]);
        assert_eq!(slides[5], vec!["b@x.com", "2 of 2"]);
        assert_eq!(slides[7], vec!["Outro"]);
        let ids: Vec<usize> = output.document.slides.iter().map(|s| s.id).collect();
        assert_eq!(ids, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_loop_drops_marker_slides() {
        use crate::LoopMarkerMode;

        init();

        let mut config = config();
        config.set_loop_markers(LoopMarkerMode::DropMarkerSlides);
        let output = Renderer::new(config).render_presentation(&loop_template(), &users()).unwrap();
        let slides: Vec<Vec<String>> = output.document.slides.iter().map(texts).collect();
        assert_eq!(slides.len(), 4);
        assert_eq!(slides[0], vec!["Intro"]);
        assert_eq!(slides[1], vec!["a@x.com", "1 of 2"]);
        assert_eq!(slides[2], vec!["b@x.com", "2 of 2"]);
        assert_eq!(slides[3], vec!["Outro"]);
    }

    #[test]
    fn test_loop_over_empty_collection() {
        init();

        let context = Context::from(json!({ "users": [] }));
        let output = renderer().render_presentation(&loop_template(), &context).unwrap();
        let slides: Vec<Vec<String>> = output.document.slides.iter().map(texts).collect();
        assert_eq!(slides, vec![vec!["Intro".to_string()], vec!["Outro".to_string()]]);
    }

    #[test]
    fn test_loop_body_expands_tables() {
        use crate::LoopMarkerMode;

        init();

        let context = Context::from(json!({
            "teams": [
                { "name": "A", "members": [ { "id": 1 }, { "id": 2 } ] },
                { "name": "B", "members": [ { "id": 3 } ] },
            ],
        }));
        let template = Presentation {
            slides: vec![
                slide(vec![text_shape("Start", "%loop team in teams%")]),
                slide(vec![text_shape("Title", "Team {{ team.name }}"), table_shape(&[&["Id"], &["{{ team.members.id }}"]])]),
                slide(vec![text_shape("End", "%endloop%")]),
            ],
        };
        let mut config = config();
        config.set_loop_markers(LoopMarkerMode::DropMarkerSlides);
        let output = Renderer::new(config).render_presentation(&template, &context).unwrap();
        let slides = &output.document.slides;
        println!("{:#?}", slides.iter().map(texts).collect::<Vec<_>>());
        assert_eq!(slides.len(), 2);
        assert_eq!(texts(&slides[0]), vec!["Team A"]);
        assert_eq!(column(table(&slides[0]), 0), vec!["Id", "1", "2"]);
        assert_eq!(texts(&slides[1]), vec!["Team B"]);
        assert_eq!(column(table(&slides[1]), 0), vec!["Id", "3"]);
        assert!(output.is_clean());
    }

    #[test]
    fn test_loop_over_scalar() {
        use crate::errors::{RenderError, ResolutionErrorKind};

        init();

        let context = Context::from(json!({ "users": "nobody" }));
        let output = renderer().render_presentation(&loop_template(), &context).unwrap();
        let slides: Vec<Vec<String>> = output.document.slides.iter().map(texts).collect();
        println!("{:#?}", slides);
        assert_eq!(slides.len(), 5);
        assert!(slides[1][0].starts_with("[ERROR: "));
        assert!(slides[1][0].contains("users"));
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Resolution { source, .. } if matches!(source.kind, ResolutionErrorKind::NotACollection { .. })
        ));

        let mut config = config();
        config.set_fail_fast(true);
        let result = Renderer::new(config).render_presentation(&loop_template(), &context);
        assert!(matches!(result, Err(RenderError::Resolution { .. })));
    }

    #[test]
    fn test_loop_validation() {
        use crate::errors::{ParseError, RenderError};

        init();

        let context = users();
        let check = |slides: Vec<Slide>| -> ParseError {
            match renderer().render_presentation(&Presentation { slides }, &context) {
                Err(RenderError::Parse { source, .. }) => source,
                other => panic!("expected a parse error, got {:?}", other),
            }
        };

        let unclosed = check(vec![slide(vec![text_shape("S", "%loop u in users%")]), slide(vec![text_shape("B", "{{ u.name }}")])]);
        assert_eq!(unclosed, ParseError::UnclosedLoop { slide: 1 });

        let nested = check(vec![
            slide(vec![text_shape("S", "%loop a in users%")]),
            slide(vec![text_shape("S", "%loop b in users%")]),
            slide(vec![text_shape("E", "%endloop%")]),
            slide(vec![text_shape("E", "%endloop%")]),
        ]);
        assert_eq!(nested, ParseError::NestedLoop { slide: 2 });

        let same = check(vec![slide(vec![text_shape("S", "%loop u in users%"), text_shape("E", "%endloop%")])]);
        assert_eq!(same, ParseError::LoopBoundsOnSameSlide { slide: 1 });

        let stray = check(vec![slide(vec![text_shape("T", "Intro")]), slide(vec![text_shape("E", "%endloop%")])]);
        assert_eq!(stray, ParseError::UnmatchedLoopEnd { slide: 2 });

        let twice = check(vec![slide(vec![text_shape("S", "%loop a in users%"), text_shape("S", "%loop b in users%")])]);
        assert_eq!(twice, ParseError::MultipleLoopStarts { slide: 1 });

        let open = check(vec![slide(vec![text_shape("S", "Before %loop u in users")])]);
        assert!(matches!(open, ParseError::Unterminated { delimiter: "%loop%", .. }));
    }

    #[test]
    fn test_standalone_list_duplicates_slide() {
        init();

        let template = Presentation {
            slides: vec![slide(vec![text_shape("Title", "Team"), text_shape("Name", "Member: {{ users.name }}")])],
        };
        let output = renderer().render_presentation(&template, &users()).unwrap();
        let slides: Vec<Vec<String>> = output.document.slides.iter().map(texts).collect();
        assert_eq!(slides, vec![vec!["Team".to_string(), "Member: Alice".into()], vec!["Team".into(), "Member: Bob".into()]]);

        let empty = renderer().render_presentation(&template, &Context::from(json!({ "users": [] }))).unwrap();
        assert!(empty.document.slides.is_empty());

        let mut config = config();
        config.set_expand_standalone_lists(false);
        let output = Renderer::new(config).render_presentation(&template, &users()).unwrap();
        assert_eq!(texts(&output.document.slides[0]), vec!["Team", "Member: Alice, Bob"]);
    }

    #[test]
    fn test_chart_expansion() {
        use crate::errors::{ExpansionError, RenderError};

        init();

        let context = Context::from(json!({ "months": ["Jan", "Feb", "Mar"], "sales": [1, 2.5, 3], "metric": "Revenue" }));
        let chart = |categories: Vec<&str>, values: Vec<ChartValue>| Shape {
            id: 2,
            name: "Chart".to_string(),
            geometry: Geometry::default(),
            kind: ShapeKind::Chart(Chart {
                categories: categories.into_iter().map(String::from).collect(),
                series: vec![ChartSeries { name: "{{ metric }}".to_string(), values }],
            }),
        };

        let template = Presentation {
            slides: vec![slide(vec![chart(vec!["{{ months }}"], vec![ChartValue::Text("{{ sales }}".to_string())])])],
        };
        let output = renderer().render_presentation(&template, &context).unwrap();
        let ShapeKind::Chart(rendered) = &output.document.slides[0].shapes[0].kind else {
            panic!("chart shape expected");
        };
        println!("{:?}", rendered);
        assert_eq!(rendered.categories, vec!["Jan", "Feb", "Mar"]);
        assert_eq!(rendered.series[0].name, "Revenue");
        assert_eq!(rendered.series[0].values, vec![ChartValue::Number(1.0), ChartValue::Number(2.5), ChartValue::Number(3.0)]);

        let context = Context::from(json!({ "sales": [1, 2] }));
        let template = Presentation {
            slides: vec![slide(vec![chart(vec!["Q1", "Q2", "Q3"], vec![ChartValue::Text("{{ sales }}".to_string())])])],
        };
        let result = renderer().render_presentation(&template, &context);
        assert!(matches!(
            result,
            Err(RenderError::Expansion { source: ExpansionError::ChartMisaligned { values: 2, categories: 3, .. }, .. })
        ));
    }

    #[test]
    fn test_images_are_fetched_in_document_order() {
        init();

        let context = Context::from(json!({ "user": { "id": 7 }, "logo": "logo" }));
        let template = Presentation {
            slides: vec![
                slide(vec![text_shape("Avatar", "%image% https://img/$user.id$.png")]),
                slide(vec![text_shape("Logo", "%image% https://img/{{ logo }}.png"), text_shape("Caption", "Logo")]),
            ],
        };
        let output = Renderer::with_fetcher(config(), StubFetcher::default()).render_presentation(&template, &context).unwrap();
        assert!(output.is_clean());

        let pictures: Vec<_> = output
            .document
            .slides
            .iter()
            .flat_map(|s| s.shapes.iter())
            .filter_map(|shape| match &shape.kind {
                ShapeKind::Picture(picture) => Some(picture),
                _ => None,
            })
            .collect();
        assert_eq!(pictures.len(), 2);
        assert_eq!(pictures[0].source, "https://img/7.png");
        assert_eq!(pictures[0].content_type, "image/png");
        assert!(pictures[0].image.ends_with(b"https://img/7.png"));
        assert_eq!(pictures[1].source, "https://img/logo.png");
    }

    #[test]
    fn test_image_failures() {
        use crate::errors::{FetchError, RenderError};

        init();

        let template = Presentation { slides: vec![slide(vec![text_shape("Broken", "%image% https://elsewhere/a.png")])] };
        let context = Context::new();

        let output = Renderer::with_fetcher(config(), StubFetcher::default()).render_presentation(&template, &context).unwrap();
        assert!(texts(&output.document.slides[0])[0].starts_with("[ERROR: "));
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Fetch { source: FetchError::NotAnImage { .. }, .. }
        ));

        let output = renderer().render_presentation(&template, &context).unwrap();
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Fetch { source: FetchError::Disabled { .. }, .. }
        ));

        let mut config = config();
        config.set_fail_fast(true);
        let result = Renderer::with_fetcher(config, StubFetcher::default()).render_presentation(&template, &context);
        assert!(matches!(result, Err(RenderError::Fetch { .. })));

        let mixed = Presentation { slides: vec![slide(vec![text_shape("Bad", "Logo: %image% https://img/a.png")])] };
        assert!(matches!(
            renderer().render_presentation(&mixed, &context),
            Err(RenderError::Parse { .. })
        ));
    }

    #[test]
    fn test_image_timeout_spares_other_placeholders() {
        use crate::errors::{FetchError, RenderError};

        init();

        let context = users();
        let template = Presentation {
            slides: vec![
                slide(vec![text_shape("Slow", "%image% https://slow/chart.png"), text_shape("Title", "Hello {{ title }}")]),
                slide(vec![text_shape("Logo", "%image% https://img/logo.png"), text_shape("Caption", "Logo")]),
            ],
        };
        let mut config = config();
        config.set_image_fetch_timeout(Duration::from_millis(250));
        let fetcher = StubFetcher::default();
        let timeouts = Arc::clone(&fetcher.timeouts);

        let output = Renderer::with_fetcher(config, fetcher).render_presentation(&template, &context).unwrap();
        let slides: Vec<Vec<String>> = output.document.slides.iter().map(texts).collect();
        println!("{:#?}", slides);
        assert_eq!(*timeouts.lock().unwrap(), vec![Duration::from_millis(250); 2]);

        assert_eq!(output.diagnostics.len(), 1);
        assert!(matches!(
            &output.diagnostics.errors()[0],
            RenderError::Fetch { source: FetchError::Timeout { url }, .. } if url == "https://slow/chart.png"
        ));
        assert!(slides[0][0].starts_with("[ERROR: "));
        assert_eq!(slides[0][1], "Hello Quarterly review");
        assert_eq!(slides[1], vec!["Logo".to_string()]);
        assert!(output.document.slides[1].shapes.iter().any(|shape| matches!(shape.kind, ShapeKind::Picture(_))));
    }

    #[test]
    fn test_worksheet_fills_columns() {
        init();

        let row = |cells: &[&str]| SheetRow { cells: cells.iter().map(|text| Cell::text(text)).collect() };
        let template = Workbook {
            sheets: vec![Worksheet {
                name: "Report".to_string(),
                rows: vec![
                    row(&["Name", "Email"]),
                    row(&["{{ users.name }}", "{{ users.email }}"]),
                    row(&["{{ sheet_name }}", "{{ total }}"]),
                ],
            }],
        };
        let mut context = users();
        context.insert("total", 42);

        let output = renderer().render_workbook(&template, &context).unwrap();
        let sheet = &output.document.sheets[0];
        let values: Vec<Vec<CellValue>> = sheet.rows.iter().map(|r| r.cells.iter().map(|c| c.value.clone()).collect()).collect();
        println!("{:?}", values);
        assert_eq!(values.len(), 4);
        assert_eq!(values[1], vec![CellValue::Text("Alice".into()), CellValue::Text("a@x.com".into())]);
        assert_eq!(values[2], vec![CellValue::Text("Bob".into()), CellValue::Text("b@x.com".into())]);
        assert_eq!(values[3], vec![CellValue::Text("Report".into()), CellValue::Number(42.0)]);
        assert!(output.is_clean());
    }

    #[test]
    fn test_worksheet_errors_name_the_cell() {
        use crate::errors::{Location, RenderError};

        init();

        let template = Workbook {
            sheets: vec![Worksheet {
                name: "Data".to_string(),
                rows: vec![SheetRow { cells: vec![Cell::text("x"), Cell::text("{{ missing }}")] }],
            }],
        };
        let output = renderer().render_workbook(&template, &Context::new()).unwrap();
        let error = &output.diagnostics.errors()[0];
        println!("{}", error);
        assert!(matches!(error, RenderError::Resolution { location: Location::SheetCell { row: 0, column: 1, .. }, .. }));
        assert!(error.to_string().contains("cell B1"));

        let errors = output.diagnostics.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].location(),
            Some(&Location::SheetCell { sheet: "Data".to_string(), row: 0, column: 1 })
        );
    }

    #[test]
    fn test_worksheet_copies_keep_literal_cells() {
        init();

        let template = Workbook {
            sheets: vec![Worksheet {
                name: "Orders".to_string(),
                rows: vec![SheetRow { cells: vec![Cell::text("Order"), Cell::text("{{ orders.id }}")] }],
            }],
        };
        let output = renderer().render_workbook(&template, &users()).unwrap();
        let values: Vec<Vec<CellValue>> =
            output.document.sheets[0].rows.iter().map(|r| r.cells.iter().map(|c| c.value.clone()).collect()).collect();
        println!("{:?}", values);
        assert_eq!(values.len(), 3);
        for (row, id) in values.iter().zip([1.0, 2.0, 3.0]) {
            assert_eq!(row, &vec![CellValue::Text("Order".into()), CellValue::Number(id)]);
        }
    }

    #[test]
    fn test_context_keys() {
        use crate::document::Document;

        init();

        let template = Presentation {
            slides: vec![
                slide(vec![text_shape("Title", "{{ title }} ({{ now | YYYY }})"), text_shape("Owner", "{{ company.name }}")]),
                slide(vec![text_shape("Start", "%loop user in users%")]),
                slide(vec![text_shape("Body", "{{ user.name }} #{{ loop_number }}")]),
                slide(vec![text_shape("End", "%endloop%"), text_shape("Active", "{{ users[is_active=True].email }}")]),
                slide(vec![text_shape("Pic", "%image% https://img/$logo$.png")]),
            ],
        };
        let keys = crate::context_keys(&Document::Presentation(template)).unwrap();
        println!("{:?}", keys);
        assert_eq!(keys.simple_fields, vec!["logo", "title"]);
        assert_eq!(keys.object_fields, vec!["company", "users"]);
    }

    #[test]
    fn test_render_bytes() {
        use crate::document::Document;

        init();

        let template = json!({
            "format": "presentation",
            "document": {
                "slides": [{
                    "shapes": [{
                        "name": "Title",
                        "type": "text",
                        "paragraphs": [{ "runs": [{ "text": "Hello {{ title }}", "style": { "size": 24 } }] }]
                    }]
                }]
            }
        });
        let bytes = serde_json::to_vec(&template).unwrap();
        let output = renderer().render_bytes(&bytes, &users()).unwrap();
        let document: Document = serde_json::from_slice(&output.document).unwrap();
        let Document::Presentation(presentation) = document else {
            panic!("presentation expected");
        };
        assert_eq!(presentation.slides[0].id, 1);
        assert_eq!(texts(&presentation.slides[0]), vec!["Hello Quarterly review"]);

        assert!(renderer().render_bytes(b"not json", &users()).is_err());
    }

    #[test]
    fn test_config_from_json() {
        use crate::LoopMarkerMode;

        init();

        let config = RenderConfig::from_json(
            r#"{ "fail_fast": true, "date_locale": "de_DE", "image_fetch_timeout": 2500,
                 "now": "2024-03-05T14:07:09", "loop_markers": "drop_marker_slides" }"#,
        )
        .unwrap();
        assert!(config.fail_fast);
        assert_eq!(config.image_fetch_timeout, Duration::from_millis(2500));
        assert_eq!(config.now, Some(fixed_now()));
        assert_eq!(config.loop_markers, LoopMarkerMode::DropMarkerSlides);
        assert!(config.expand_standalone_lists);

        let output = Renderer::new(config).render_text("{{ now | MMMM }}", &Context::new()).unwrap();
        assert_eq!(output.document, "März");

        assert!(RenderConfig::from_json(r#"{ "date_locale": "xx_XX" }"#).is_err());
    }
}
