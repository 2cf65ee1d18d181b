use log::{debug, trace};

use crate::config::RenderSettings;
use crate::context::Scope;
use crate::core::expander::{self, Fill, PendingCells, RowGrid};
use crate::core::images::{self, ImageFetcher};
use crate::core::literal;
use crate::core::loops::{self, LoopRange, Marker, Section};
use crate::core::text::{process_text, process_text_list, recover};
use crate::core::{Evaluator, Rendered, TextMode};
use crate::document::{Chart, ChartValue, Paragraph, Picture, Presentation, ShapeKind, Slide, Table, TextFrame};
use crate::errors::{Diagnostics, Location, ParseError, RenderError, ResolutionError, ResolutionErrorKind};
use crate::parser::{self, Token};
use crate::types::Value;
use crate::Context;

/// An `%image%` shape waiting for its bytes.
struct ImageJob {
    slide: usize,
    shape: usize,
    url: String,
    directive: String,
    location: Location,
}

struct PresentationPass<'r> {
    settings: &'r RenderSettings,
    diagnostics: Diagnostics,
    slides: Vec<Slide>,
    jobs: Vec<ImageJob>,
}

/// Renders a presentation template. Loops are planned and validated first, slides are
/// then rendered in order, and images are fetched last.
pub fn render_presentation(
    template: &Presentation,
    context: &Context,
    settings: &RenderSettings,
    fetcher: &dyn ImageFetcher,
) -> Result<(Presentation, Diagnostics), RenderError> {
    let mut source = template.clone();
    for (index, slide) in source.slides.iter_mut().enumerate() {
        merge_slide_runs(slide, index + 1)?;
    }

    let markers = collect_markers(&source)?;
    let sections = loops::plan_sections(&markers).map_err(|e| RenderError::parse(&Location::Document, e))?;
    debug!("Presentation has {} slides in {} sections", source.slides.len(), sections.len());

    let mut pass = PresentationPass { settings, diagnostics: Diagnostics::default(), slides: Vec::new(), jobs: Vec::new() };
    let scope = Scope::new(context);
    for section in &sections {
        match section {
            Section::Plain(index) => pass.render_slide(source.slides[*index].clone(), index + 1, &scope, &[])?,
            Section::Loop(range) => pass.render_loop(&source, range, &scope)?,
        }
    }
    pass.embed_images(fetcher)?;

    for (index, slide) in pass.slides.iter_mut().enumerate() {
        slide.id = index + 1;
    }
    Ok((Presentation { slides: pass.slides }, pass.diagnostics))
}

impl<'r> PresentationPass<'r> {
    fn render_loop(&mut self, source: &Presentation, range: &LoopRange, scope: &Scope) -> Result<(), RenderError> {
        let settings = self.settings;
        let location = Location::Slide { slide: range.start + 1, shape: String::new() };
        let expression = strip_braces(&range.collection);
        let evaluator = Evaluator::new(scope, settings);

        let collection = match evaluator.evaluate(expression) {
            Ok(Value::List(items)) => Ok(items),
            Ok(other) => Err(RenderError::resolution(
                &location,
                ResolutionError::new(
                    range.raw.clone(),
                    ResolutionErrorKind::NotACollection { expression: expression.to_string(), found: other.type_name() },
                ),
            )),
            Err(e) => Err(e.at(&location)),
        };

        match collection {
            Ok(items) => {
                let count = items.len();
                debug!("Loop '{}' repeats slides {:?} {} times", range.variable, range.body(settings.loop_markers), count);
                for (number, item) in items.into_iter().enumerate() {
                    let iteration = loops::iteration_scope(scope, &range.variable, item, number, count);
                    for index in range.body(settings.loop_markers) {
                        let (slide, _) = strip_loop_directives(source.slides[index].clone(), None);
                        self.render_slide(slide, index + 1, &iteration, &[])?;
                    }
                }
            }
            Err(error) => {
                let marker = recover(error, settings, &mut self.diagnostics)?;
                for index in range.start..=range.end {
                    let replacement = (index == range.start).then_some(marker.as_str());
                    let (slide, frozen) = strip_loop_directives(source.slides[index].clone(), replacement);
                    self.render_slide(slide, index + 1, scope, &frozen)?;
                }
            }
        }
        Ok(())
    }

    /// Renders one template slide, duplicating it when its only placeholder is a list.
    /// Paragraphs listed in `frozen` are copied through untouched.
    fn render_slide(
        &mut self,
        mut slide: Slide,
        number: usize,
        scope: &Scope,
        frozen: &[(usize, usize)],
    ) -> Result<(), RenderError> {
        let settings = self.settings;
        if settings.expand_standalone_lists {
            if let Some((shape, paragraph)) = lone_placeholder(&slide, number, frozen)? {
                let location = Location::Slide { slide: number, shape: slide.shapes[shape].name.clone() };
                let text = paragraph_text(&slide, shape, paragraph);
                let evaluator = Evaluator::new(scope, settings);
                let mut skip = frozen.to_vec();
                skip.push((shape, paragraph));
                match process_text(&text, &evaluator, TextMode::Table, &location, &mut self.diagnostics)? {
                    Rendered::List(values) => {
                        debug!("Slide {} expands into {} slides", number, values.len());
                        for value in values {
                            let mut copy = slide.clone();
                            set_paragraph_text(&mut copy, shape, paragraph, &value);
                            self.render_shapes(copy, number, scope, &skip)?;
                        }
                    }
                    Rendered::Text(value) => {
                        set_paragraph_text(&mut slide, shape, paragraph, &value);
                        self.render_shapes(slide, number, scope, &skip)?;
                    }
                }
                return Ok(());
            }
        }
        self.render_shapes(slide, number, scope, frozen)
    }

    fn render_shapes(
        &mut self,
        mut slide: Slide,
        number: usize,
        scope: &Scope,
        skip: &[(usize, usize)],
    ) -> Result<(), RenderError> {
        let settings = self.settings;
        let evaluator = Evaluator::new(scope, settings);
        let mut images = Vec::new();

        for (index, shape) in slide.shapes.iter_mut().enumerate() {
            let name = shape.name.clone();
            match &mut shape.kind {
                ShapeKind::Text(frame) => {
                    let location = Location::Slide { slide: number, shape: name };
                    if let Some((source, directive)) = image_directive(frame, &location)? {
                        match self.resolve_image_url(&source, &evaluator, &location)? {
                            Ok(url) => images.push((index, url, directive, location)),
                            Err(marker) => frame.set_text(&marker),
                        }
                        continue;
                    }
                    let skipped: Vec<usize> =
                        skip.iter().filter(|(shape, _)| *shape == index).map(|(_, paragraph)| *paragraph).collect();
                    self.render_frame(frame, &evaluator, &location, &skipped)?;
                }
                ShapeKind::Table(table) => self.render_table(table, &evaluator, number, &name)?,
                ShapeKind::Chart(chart) => {
                    self.render_chart(chart, &evaluator, &Location::Chart { slide: number, shape: name })?
                }
                ShapeKind::Picture(_) => (),
            }
        }

        let slide_index = self.slides.len();
        self.jobs.extend(images.into_iter().map(|(shape, url, directive, location)| ImageJob {
            slide: slide_index,
            shape,
            url,
            directive,
            location,
        }));
        self.slides.push(slide);
        Ok(())
    }

    fn render_frame(
        &mut self,
        frame: &mut TextFrame,
        evaluator: &Evaluator,
        location: &Location,
        skip: &[usize],
    ) -> Result<(), RenderError> {
        for (index, paragraph) in frame.paragraphs.iter_mut().enumerate() {
            if skip.contains(&index) {
                continue;
            }
            for run in &mut paragraph.runs {
                let rendered = process_text(&run.text, evaluator, TextMode::Normal, location, &mut self.diagnostics)?;
                run.text = rendered.into_text();
            }
        }
        Ok(())
    }

    fn render_table(&mut self, table: &mut Table, evaluator: &Evaluator, slide: usize, shape: &str) -> Result<(), RenderError> {
        let mut pending = PendingCells::new(table, |row, column| table.rows[row].cells[column].text().contains("{{"));

        let mut row = 0;
        'rows: while row < pending.row_count() {
            let mut column = 0;
            while column < pending.width(row) {
                if !pending.is_pending(row, column) {
                    column += 1;
                    continue;
                }
                pending.done(row, column);

                let location = Location::TableCell { slide, shape: shape.to_string(), row, column };
                let text = table.rows[row].cells[column].text();
                let tokens = parser::tokenize(&text).map_err(|e| RenderError::parse(&location, e))?;
                let count = parser::placeholder_count(&tokens);
                trace!("Table cell {} holds {} placeholders", location, count);

                match process_text(text.trim(), evaluator, TextMode::Table, &location, &mut self.diagnostics)? {
                    Rendered::List(values) if count == 1 => {
                        let width = table.width(row);
                        let fill = expander::fill_column(table, row, column, &values)
                            .map_err(|e| RenderError::expansion(&location, e))?;
                        pending.apply(&fill, column, width);
                        if let Fill::Removed { .. } = fill {
                            continue 'rows;
                        }
                    }
                    rendered => table.rows[row].cells[column].frame.set_text(&rendered.into_text()),
                }
                column += 1;
            }
            row += 1;
        }
        Ok(())
    }

    fn render_chart(&mut self, chart: &mut Chart, evaluator: &Evaluator, location: &Location) -> Result<(), RenderError> {
        chart.categories = process_text_list(&chart.categories, evaluator, location, &mut self.diagnostics)?;

        for series in &mut chart.series {
            series.name = process_text(&series.name, evaluator, TextMode::Normal, location, &mut self.diagnostics)?.into_text();

            if series.values.iter().any(|value| matches!(value, ChartValue::Text(_))) {
                let texts: Vec<String> = series
                    .values
                    .iter()
                    .map(|value| match value {
                        ChartValue::Number(n) => n.to_string(),
                        ChartValue::Text(text) => text.clone(),
                    })
                    .collect();
                let rendered = process_text_list(&texts, evaluator, location, &mut self.diagnostics)?;
                series.values = rendered
                    .into_iter()
                    .map(|text| self.chart_value(text, evaluator, location))
                    .collect::<Result<_, _>>()?;
            }

            if series.values.len() != chart.categories.len() {
                return Err(RenderError::expansion(
                    location,
                    crate::errors::ExpansionError::ChartMisaligned {
                        series: series.name.clone(),
                        values: series.values.len(),
                        categories: chart.categories.len(),
                    },
                ));
            }
        }
        Ok(())
    }

    fn chart_value(&mut self, text: String, evaluator: &Evaluator, location: &Location) -> Result<ChartValue, RenderError> {
        if let Some(number) = literal::parse_number(&text) {
            return Ok(ChartValue::Number(number.as_f64()));
        }
        if text.starts_with("[ERROR:") {
            return Ok(ChartValue::Text(text));
        }
        let error = ResolutionError::new(text.clone(), ResolutionErrorKind::NotNumeric { value: text });
        let marker = recover(RenderError::resolution(location, error), evaluator.settings(), &mut self.diagnostics)?;
        Ok(ChartValue::Text(marker))
    }

    /// Resolves `$...$` and `{{ ... }}` spans inside an image URL. `Err` carries the inline marker.
    fn resolve_image_url(
        &mut self,
        source: &str,
        evaluator: &Evaluator,
        location: &Location,
    ) -> Result<Result<String, String>, RenderError> {
        let substituted = parser::substitute_nested(source, |inner| evaluator.evaluate(inner).map(|v| v.to_string()));
        let url = match substituted {
            Ok(url) => url,
            Err(e) => return recover(e.at(location), evaluator.settings(), &mut self.diagnostics).map(Err),
        };
        if !url.contains("{{") {
            return Ok(Ok(url.trim().to_string()));
        }
        let before = self.diagnostics.len();
        let url = process_text(&url, evaluator, TextMode::Normal, location, &mut self.diagnostics)?.into_text();
        if self.diagnostics.len() > before {
            return Ok(Err(url));
        }
        Ok(Ok(url.trim().to_string()))
    }

    fn embed_images(&mut self, fetcher: &dyn ImageFetcher) -> Result<(), RenderError> {
        if self.jobs.is_empty() {
            return Ok(());
        }
        let jobs = std::mem::take(&mut self.jobs);
        let urls: Vec<String> = jobs.iter().map(|job| job.url.clone()).collect();
        let results = images::fetch_all(fetcher, &urls, self.settings.image_fetch_timeout);

        for (job, result) in jobs.into_iter().zip(results) {
            let Some(shape) = self.slides.get_mut(job.slide).and_then(|slide| slide.shapes.get_mut(job.shape)) else {
                continue;
            };
            match result {
                Ok(image) => {
                    debug!("Embedding {} ({} bytes) at {}", job.url, image.bytes.len(), job.location);
                    shape.kind = ShapeKind::Picture(Picture {
                        image: image.bytes,
                        content_type: image.content_type.to_string(),
                        source: job.url,
                    });
                }
                Err(source) => {
                    let error = RenderError::Fetch { location: job.location, directive: job.directive, source };
                    let marker = recover(error, self.settings, &mut self.diagnostics)?;
                    match &mut shape.kind {
                        ShapeKind::Text(frame) => frame.set_text(&marker),
                        other => *other = ShapeKind::Text(TextFrame::from_text(&marker)),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Merges runs so that no directive is split across run boundaries. The merged run
/// keeps the formatting of the run the directive starts in.
pub fn merge_split_runs(paragraph: &mut Paragraph) -> Result<(), ParseError> {
    let tokens = parser::tokenize(&paragraph.text())?;
    if paragraph.runs.len() < 2 {
        return Ok(());
    }

    let mut starts = Vec::with_capacity(paragraph.runs.len());
    let mut offset = 0;
    for run in &paragraph.runs {
        starts.push(offset);
        offset += run.text.len();
    }
    let run_at = |position: usize| starts.partition_point(|&start| start <= position).saturating_sub(1);

    let mut groups: Vec<(usize, usize)> = Vec::new();
    let mut position = 0;
    for token in &tokens {
        let length = token.raw().len();
        if !matches!(token, Token::Literal(_)) && length > 0 {
            let (first, last) = (run_at(position), run_at(position + length - 1));
            if first < last {
                match groups.last_mut() {
                    Some(group) if first <= group.1 => group.1 = group.1.max(last),
                    _ => groups.push((first, last)),
                }
            }
        }
        position += length;
    }
    if groups.is_empty() {
        return Ok(());
    }

    trace!("Merging split runs {:?}", groups);
    let runs = std::mem::take(&mut paragraph.runs);
    let mut groups = groups.into_iter().peekable();
    let mut index = 0;
    while index < runs.len() {
        match groups.peek() {
            Some(&(first, last)) if first == index => {
                let mut merged = runs[first].clone();
                merged.text = runs[first..=last].iter().map(|run| run.text.as_str()).collect();
                paragraph.runs.push(merged);
                groups.next();
                index = last + 1;
            }
            _ => {
                paragraph.runs.push(runs[index].clone());
                index += 1;
            }
        }
    }
    Ok(())
}

fn merge_slide_runs(slide: &mut Slide, number: usize) -> Result<(), RenderError> {
    for shape in &mut slide.shapes {
        let location = Location::Slide { slide: number, shape: shape.name.clone() };
        let paragraphs: Vec<&mut Paragraph> = match &mut shape.kind {
            ShapeKind::Text(frame) => frame.paragraphs.iter_mut().collect(),
            ShapeKind::Table(table) => table
                .rows
                .iter_mut()
                .flat_map(|row| row.cells.iter_mut())
                .flat_map(|cell| cell.frame.paragraphs.iter_mut())
                .collect(),
            _ => Vec::new(),
        };
        for paragraph in paragraphs {
            merge_split_runs(paragraph).map_err(|e| RenderError::parse(&location, e))?;
        }
    }
    Ok(())
}

fn collect_markers(presentation: &Presentation) -> Result<Vec<Vec<Marker>>, RenderError> {
    presentation
        .slides
        .iter()
        .enumerate()
        .map(|(index, slide)| {
            let mut markers = Vec::new();
            for shape in &slide.shapes {
                let ShapeKind::Text(frame) = &shape.kind else {
                    continue;
                };
                for paragraph in &frame.paragraphs {
                    let tokens = parser::tokenize(&paragraph.text()).map_err(|e| {
                        RenderError::parse(&Location::Slide { slide: index + 1, shape: shape.name.clone() }, e)
                    })?;
                    markers.extend(tokens.iter().filter_map(Marker::from_token));
                }
            }
            Ok(markers)
        })
        .collect()
}

/// Removes loop directives from text shapes; a shape left with no text is dropped.
/// With a `replacement`, the start directive is swapped for it and the positions of
/// the paragraphs that received it are returned.
fn strip_loop_directives(mut slide: Slide, replacement: Option<&str>) -> (Slide, Vec<(usize, usize)>) {
    let mut replaced_at = Vec::new();
    let mut kept = 0;
    slide.shapes.retain_mut(|shape| {
        let ShapeKind::Text(frame) = &mut shape.kind else {
            kept += 1;
            return true;
        };
        let mut touched = false;
        let mut replaced = Vec::new();
        for (index, paragraph) in frame.paragraphs.iter_mut().enumerate() {
            for run in &mut paragraph.runs {
                if !run.text.contains('%') {
                    continue;
                }
                let Ok(tokens) = parser::tokenize(&run.text) else {
                    continue;
                };
                if !tokens.iter().any(|t| matches!(t, Token::LoopStart { .. } | Token::LoopEnd { .. })) {
                    continue;
                }
                touched = true;
                if replacement.is_some() && tokens.iter().any(|t| matches!(t, Token::LoopStart { .. })) {
                    replaced.push(index);
                }
                run.text = tokens
                    .iter()
                    .map(|token| match token {
                        Token::LoopStart { .. } => replacement.unwrap_or_default(),
                        Token::LoopEnd { .. } => "",
                        other => other.raw(),
                    })
                    .collect();
            }
        }
        let keep = !touched || !frame.text().trim().is_empty();
        if keep {
            replaced_at.extend(replaced.into_iter().map(|paragraph| (kept, paragraph)));
            kept += 1;
        }
        keep
    });
    (slide, replaced_at)
}

/// Position of the slide's only placeholder, when it sits in a text shape.
fn lone_placeholder(slide: &Slide, number: usize, frozen: &[(usize, usize)]) -> Result<Option<(usize, usize)>, RenderError> {
    let mut count = 0;
    let mut found = None;

    for (shape_index, shape) in slide.shapes.iter().enumerate() {
        let location = Location::Slide { slide: number, shape: shape.name.clone() };
        let placeholders = |text: &str| {
            parser::tokenize(text)
                .map(|tokens| parser::placeholder_count(&tokens))
                .map_err(|e| RenderError::parse(&location, e))
        };
        match &shape.kind {
            ShapeKind::Text(frame) => {
                for (paragraph_index, paragraph) in frame.paragraphs.iter().enumerate() {
                    if frozen.contains(&(shape_index, paragraph_index)) {
                        continue;
                    }
                    let n = placeholders(&paragraph.text())?;
                    if n > 0 {
                        count += n;
                        found = Some((shape_index, paragraph_index));
                    }
                }
            }
            ShapeKind::Table(table) => {
                for cell in table.rows.iter().flat_map(|row| row.cells.iter()) {
                    count += placeholders(&cell.text())?;
                }
            }
            ShapeKind::Chart(chart) => {
                let values = chart.series.iter().flat_map(|s| s.values.iter()).filter_map(|value| match value {
                    ChartValue::Text(text) => Some(text.as_str()),
                    ChartValue::Number(_) => None,
                });
                let names = chart.series.iter().map(|s| s.name.as_str());
                for text in chart.categories.iter().map(String::as_str).chain(names).chain(values) {
                    count += placeholders(text)?;
                }
            }
            ShapeKind::Picture(_) => (),
        }
        if count > 1 {
            return Ok(None);
        }
    }
    Ok(if count == 1 { found } else { None })
}

/// Returns the URL expression and the raw directive when the frame is an `%image%` marker.
fn image_directive(frame: &TextFrame, location: &Location) -> Result<Option<(String, String)>, RenderError> {
    let text = frame.text();
    if !text.contains("%image%") {
        return Ok(None);
    }
    let tokens = parser::tokenize(text.trim()).map_err(|e| RenderError::parse(location, e))?;
    let mut image = None;
    for token in &tokens {
        match token {
            Token::Image { source, raw } if image.is_none() => image = Some((source.clone(), raw.clone())),
            Token::Literal(text) if text.trim().is_empty() => (),
            other => {
                return Err(RenderError::parse(location, ParseError::MisplacedDirective { text: other.raw().to_string() }))
            }
        }
    }
    Ok(image)
}

fn paragraph_text(slide: &Slide, shape: usize, paragraph: usize) -> String {
    match slide.shapes.get(shape).map(|s| &s.kind) {
        Some(ShapeKind::Text(frame)) => frame.paragraphs.get(paragraph).map(Paragraph::text).unwrap_or_default(),
        _ => String::new(),
    }
}

fn set_paragraph_text(slide: &mut Slide, shape: usize, paragraph: usize, text: &str) {
    if let Some(ShapeKind::Text(frame)) = slide.shapes.get_mut(shape).map(|s| &mut s.kind) {
        if let Some(p) = frame.paragraphs.get_mut(paragraph) {
            p.set_text(text);
        }
    }
}

/// Accepts `%loop x in {{ items }}%` as well as the bare expression.
fn strip_braces(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}
