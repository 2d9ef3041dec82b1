use std::cell::RefCell;
use std::rc::Rc;

use leptos::*;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;

use serde_wasm_bindgen::to_value as to_js;
use web_sys::{Blob, FileList, HtmlInputElement};

use imu_norm::{
    series_csv_string, ImuError, IngestReport, ParseCache, Processed, Sample, TimeUnit,
};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_COMMIT: &str = env!("GIT_COMMIT_HASH");

const PREVIEW_ROWS: usize = 30;
const DEFAULT_MAX_POINTS: usize = 5000;

#[derive(Clone)]
struct FileBytes {
    name: String,
    bytes: Rc<Vec<u8>>,
}

/// Everything the page shows for one upload under one set of controls.
#[derive(Clone, PartialEq)]
struct Outcome {
    report: IngestReport,
    preview: Vec<Sample>,
    total_rows: usize,
    processed: Processed,
}

async fn read_file(file: web_sys::File) -> Option<FileBytes> {
    let name = file.name();
    let buf = JsFuture::from(file.array_buffer()).await.ok()?;
    let u8arr = js_sys::Uint8Array::new(&buf);
    let mut bytes = vec![0u8; u8arr.length() as usize];
    u8arr.copy_to(&mut bytes[..]);
    Some(FileBytes {
        name,
        bytes: Rc::new(bytes),
    })
}

async fn read_first_from_list(list: &FileList) -> Option<FileBytes> {
    read_file(list.item(0)?).await
}

fn run_pipeline(
    cache: &mut ParseCache,
    bytes: &[u8],
    unit: TimeUnit,
    max_points: Option<usize>,
) -> Result<Outcome, ImuError> {
    let ingested = cache.get_or_parse(bytes)?;
    let processed = imu_norm::process(&ingested.table, unit, max_points)?;
    Ok(Outcome {
        report: ingested.report.clone(),
        preview: ingested.table.head(PREVIEW_ROWS).to_vec(),
        total_rows: ingested.table.len(),
        processed,
    })
}

fn time_unit_from(sel: &str, fps: f64) -> TimeUnit {
    match sel {
        "s" => TimeUnit::Seconds,
        "frames" => TimeUnit::Frames { fps },
        _ => TimeUnit::Milliseconds,
    }
}

fn plot_xy(div_id: &str, traces: &js_sys::Array, layout: &JsValue) {
    let Some(div) = web_sys::window()
        .and_then(|w| w.document())
        .and_then(|d| d.get_element_by_id(div_id))
    else {
        return;
    };
    let plotly = js_sys::Reflect::get(&js_sys::global(), &JsValue::from_str("Plotly"))
        .unwrap_or(JsValue::UNDEFINED);
    if let Ok(func) = js_sys::Reflect::get(&plotly, &JsValue::from_str("react"))
        .or_else(|_| js_sys::Reflect::get(&plotly, &JsValue::from_str("newPlot")))
        .and_then(|v| v.dyn_into::<js_sys::Function>())
    {
        let _ = func.call3(&JsValue::NULL, &JsValue::from(div), &traces.into(), layout);
    }
}

fn build_line_trace(name: &str, x: &[f64], y: &[f64], color: &str) -> JsValue {
    let trace = js_sys::Object::new();
    let set = |key: &str, value: &JsValue| {
        js_sys::Reflect::set(&trace, &JsValue::from_str(key), value).ok();
    };
    set("type", &JsValue::from_str("scattergl"));
    set("mode", &JsValue::from_str("lines"));
    set("name", &JsValue::from_str(name));
    set("x", &js_sys::Float64Array::from(x).into());
    set("y", &js_sys::Float64Array::from(y).into());
    if let Ok(line) = to_js(&serde_json::json!({ "width": 1.5, "color": color })) {
        set("line", &line);
    }
    set(
        "hovertemplate",
        &JsValue::from_str("t %{x:.3f} s<br>norm %{y:.4f}<extra></extra>"),
    );
    trace.into()
}

fn render_norm_plot(processed: &Processed) {
    let times: Vec<f64> = processed.display.iter().map(|p| p.time_s).collect();
    let norms: Vec<f64> = processed.display.iter().map(|p| p.norm).collect();

    let data = js_sys::Array::new();
    data.push(&build_line_trace("Norm", &times, &norms, "#0072b2"));

    let layout = serde_json::json!({
        "title": "Norm (x, y, z) vs time",
        "hovermode": "x unified",
        "xaxis": { "title": "Time (s)" },
        "yaxis": { "title": "Norm" },
        "showlegend": false
    });
    if let Ok(layout_js) = to_js(&layout) {
        plot_xy("norm_plot", &data, &layout_js);
    }
}

fn blob_url_from_str(s: &str) -> Option<String> {
    let arr = js_sys::Array::new();
    arr.push(&JsValue::from_str(s));
    let blob = Blob::new_with_str_sequence(&arr).ok()?;
    web_sys::Url::create_object_url_with_blob(&blob).ok()
}

fn fmt_metric(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.4}")
    } else {
        "n/a".to_string()
    }
}

#[component]
pub fn App() -> impl IntoView {
    let cache = Rc::new(RefCell::new(ParseCache::default()));

    let (upload, set_upload) = create_signal(Option::<FileBytes>::None);
    let (reading, set_reading) = create_signal(false);
    let (unit_sel, set_unit_sel) = create_signal(String::from("ms"));
    let (fps, set_fps) = create_signal(30.0_f64);
    let (max_points, set_max_points) = create_signal(DEFAULT_MAX_POINTS); // 0 => all points
    let (csv_href, set_csv_href) = create_signal(String::new());

    // Re-runs on any control change; the cache keeps the parse from repeating.
    let outcome = create_memo(move |_| -> Option<Result<Outcome, String>> {
        let file = upload.get()?;
        let unit = time_unit_from(&unit_sel.get(), fps.get());
        let budget = Some(max_points.get()).filter(|&m| m > 0);
        let result = run_pipeline(&mut cache.borrow_mut(), &file.bytes, unit, budget)
            .map_err(|err| err.to_string());
        Some(result)
    });

    create_effect(move |_| {
        let old = csv_href.get_untracked();
        if !old.is_empty() {
            let _ = web_sys::Url::revoke_object_url(&old);
        }
        match outcome.get() {
            Some(Ok(done)) => {
                render_norm_plot(&done.processed);
                let href = series_csv_string(&done.processed.display)
                    .ok()
                    .and_then(|csv| blob_url_from_str(&csv))
                    .unwrap_or_default();
                set_csv_href.set(href);
            }
            _ => set_csv_href.set(String::new()),
        }
    });

    let accept_files = move |list: FileList| {
        set_reading.set(true);
        spawn_local(async move {
            set_upload.set(read_first_from_list(&list).await);
            set_reading.set(false);
        });
    };

    let on_files = move |ev: leptos::ev::Event| {
        let Some(input) = ev
            .target()
            .and_then(|t| t.dyn_into::<HtmlInputElement>().ok())
        else {
            return;
        };
        if let Some(list) = input.files() {
            accept_files(list);
        }
    };

    let on_drop = move |ev: leptos::ev::DragEvent| {
        ev.prevent_default();
        if let Some(list) = ev.data_transfer().and_then(|dt| dt.files()) {
            accept_files(list);
        }
    };

    let status = move || {
        if reading.get() {
            return "Reading file…".to_string();
        }
        match (upload.get(), outcome.get()) {
            (None, _) => "Select a CSV/TXT file exported by the phone to begin.".to_string(),
            (Some(file), Some(Ok(done))) => format!(
                "{}: {} samples ({} of {} rows kept, {}, {}-delimited).",
                file.name,
                done.total_rows,
                done.report.rows_kept,
                done.report.rows_read,
                done.report.encoding,
                done.report.delimiter
            ),
            (Some(file), Some(Err(err))) => format!("Could not read {}: {err}", file.name),
            (Some(_), None) => String::new(),
        }
    };

    let metrics_view = move || {
        outcome.get().and_then(|r| r.ok()).map(|done| {
            let stats = done.processed.stats;
            view! {
                <div class="metrics">
                    <div class="metric"><span class="label">"Samples"</span><span class="value">{stats.count}</span></div>
                    <div class="metric"><span class="label">"Mean"</span><span class="value">{fmt_metric(stats.mean)}</span></div>
                    <div class="metric"><span class="label">"RMS"</span><span class="value">{fmt_metric(stats.rms)}</span></div>
                    <div class="metric"><span class="label">"Min"</span><span class="value">{fmt_metric(stats.min)}</span></div>
                    <div class="metric"><span class="label">"Max"</span><span class="value">{fmt_metric(stats.max)}</span></div>
                </div>
                <p class="note">{format!("Plotted {} of {} points.", done.processed.display.len(), stats.count)}</p>
            }
        })
    };

    let preview_view = move || {
        outcome.get().and_then(|r| r.ok()).map(|done| {
            let rows = done
                .preview
                .iter()
                .map(|s| {
                    view! {
                        <tr>
                            <td>{format!("{:.3}", s.time)}</td>
                            <td>{format!("{:.5}", s.x)}</td>
                            <td>{format!("{:.5}", s.y)}</td>
                            <td>{format!("{:.5}", s.z)}</td>
                        </tr>
                    }
                })
                .collect_view();
            view! {
                <details class="preview">
                    <summary>{format!("Preview (first {} of {} rows, {} columns in file)", done.preview.len(), done.total_rows, done.report.columns)}</summary>
                    <table>
                        <thead><tr><th>"Time"</th><th>"X"</th><th>"Y"</th><th>"Z"</th></tr></thead>
                        <tbody>{rows}</tbody>
                    </table>
                </details>
            }
        })
    };

    view! {
        <main class="tufte" on:dragover=move |e| { e.prevent_default(); } on:drop=on_drop>
            <header>
                <h1>"Inertial Sensor Norm"</h1>
                <p class="subtitle">"Upload an accelerometer or gyroscope log to chart the norm of its three axes."</p>
                <p class="note">{"Web version "}{APP_VERSION}{" ("}{APP_COMMIT}{")"}</p>
            </header>
            <section class="controls">
                <label class="dropzone">
                    <span>"Drag & drop or click to choose a CSV/TXT file"</span>
                    <input id="file_input" type="file" accept=".csv,.txt" on:change=on_files />
                </label>
                <div class="control-row">
                    <label class="note">"Time column:"</label>
                    <select on:change=move |ev| set_unit_sel.set(event_target_value(&ev)) prop:value=move || unit_sel.get()>
                        <option value="ms">"milliseconds"</option>
                        <option value="s">"seconds"</option>
                        <option value="frames">"frames"</option>
                    </select>
                    <label style=move || if unit_sel.get() == "frames" { "" } else { "display:none;" }>
                        "Frame rate (Hz): "
                        <input type="number" min="0" step="any" prop:value=move || fps.get().to_string()
                            on:change=move |ev| {
                                if let Ok(v) = event_target_value(&ev).parse::<f64>() { set_fps.set(v); }
                            }/>
                    </label>
                    <label>"Max points: "
                        <input type="number" min="0" prop:value=move || max_points.get().to_string()
                            on:change=move |ev| {
                                let v = event_target_value(&ev).parse::<usize>().unwrap_or(0);
                                set_max_points.set(v);
                            }/>
                    </label>
                </div>
                <span class="note">{status}</span>
            </section>
            <section class="plots">
                {metrics_view}
                <div id="norm_plot" class="plot"></div>
            </section>
            <section class="files">
                {preview_view}
                <p class="note">"Nothing leaves your device. All processing happens locally in your browser."</p>
            </section>
            <section class="downloads">
                <a id="dl_norm" href=move || csv_href.get() download="norm.csv" style=move || if csv_href.get().is_empty() {"display:none;".to_string()} else {"display:inline;".to_string()}>"Download norm.csv"</a>
            </section>
        </main>
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen::prelude::wasm_bindgen(start)]
pub fn start() {
    console_error_panic_hook::set_once();
    leptos::mount_to_body(|| view! { <App/> });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_from_select() {
        assert_eq!(time_unit_from("ms", 30.0), TimeUnit::Milliseconds);
        assert_eq!(time_unit_from("s", 30.0), TimeUnit::Seconds);
        assert_eq!(time_unit_from("frames", 60.0), TimeUnit::Frames { fps: 60.0 });
        assert_eq!(time_unit_from("", 60.0), TimeUnit::Milliseconds);
    }

    #[test]
    fn test_pipeline_reuses_parse() {
        let raw: Vec<u8> = (0..6)
            .map(|i| format!("{};0,6;0,8;0\n", i * 100))
            .collect::<String>()
            .into_bytes();
        let mut cache = ParseCache::default();
        let ms = run_pipeline(&mut cache, &raw, TimeUnit::Milliseconds, None).unwrap();
        let s = run_pipeline(&mut cache, &raw, TimeUnit::Seconds, Some(3)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(ms.total_rows, 6);
        assert_eq!(s.processed.display.len(), 3);
        assert!((ms.processed.display[1].time_s - 0.1).abs() < 1e-12);
        assert!((ms.processed.stats.mean - 1.0).abs() < 1e-12);
    }
}
